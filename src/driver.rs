//! Pass driver: the allocate/spill fixed point.
//!
//! The local pass runs once; if it leaves anything unassigned, the global
//! scan takes over inside a bounded loop. Each global iteration renumbers the
//! kernel, recomputes liveness, scans, and either converges or generates
//! spill code and retries. Fail-safe mode reserves a window of rows for spill
//! temporaries when ordinary allocation of them starts failing.

use crate::global::GlobalAllocator;
use crate::ir::cfg::Kernel;
use crate::ir::declare::{DeclId, PhysReg};
use crate::liveness::Liveness;
use crate::local::{self, LocalAllocator};
use crate::platform::Platform;
use crate::spill::codegen::{FailSafeWindow, SpillCodeGenerator, SpillStats};
use crate::spill::layout::SpillLayout;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RaConfig {
    /// Global allocate/spill rounds before giving up.
    pub iteration_cap: u32,
    /// Abort when inserted spill/fill instructions exceed this fraction of
    /// the kernel's instruction count.
    pub spill_abort_ratio: f32,
    /// Reserve rows for spill temporaries when their allocation fails.
    pub fail_safe: bool,
    pub bank_conflict_reduction: bool,
    /// Rotate search start between banks based on release timestamps.
    pub round_robin: bool,
    /// Verbose eviction/iteration dumps to stderr.
    pub trace: bool,
}

impl Default for RaConfig {
    fn default() -> Self {
        RaConfig {
            iteration_cap: 10,
            spill_abort_ratio: 1.0,
            fail_safe: true,
            bank_conflict_reduction: true,
            round_robin: true,
            trace: false,
        }
    }
}

// =============================================================================
// Errors and state
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RaError {
    /// No placement exists even after spilling everything legal.
    AllocationFailure { decl: String },
    /// Spill growth blew the configured budget or the scratch surface.
    SpillBudgetExceeded { used: u32, limit: u32 },
    /// The allocate/spill loop did not converge within the cap.
    IterationBudgetExceeded { iterations: u32 },
}

impl std::fmt::Display for RaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaError::AllocationFailure { decl } => {
                write!(f, "no register assignment possible for `{decl}`")
            }
            RaError::SpillBudgetExceeded { used, limit } => {
                write!(f, "spill budget exceeded: {used} > {limit}")
            }
            RaError::IterationBudgetExceeded { iterations } => {
                write!(f, "register allocation did not converge in {iterations} iterations")
            }
        }
    }
}

impl std::error::Error for RaError {}

/// Driver phases, mostly for tracing and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaState {
    Init,
    IntervalsBuilt,
    Allocated,
    Spilling,
    Converged,
    Failed,
}

// =============================================================================
// Observation
// =============================================================================

/// Debug-info hook invoked as assignments and spill slots become final.
pub trait AllocObserver {
    fn on_assign(&mut self, _decl: DeclId, _reg: PhysReg) {}
    fn on_spill(&mut self, _decl: DeclId, _disp: u32) {}
}

pub struct NoopObserver;

impl AllocObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllocatorStats {
    pub iterations: u32,
    pub locals_assigned: u32,
    pub trivially_assigned: u32,
    pub globals_assigned: u32,
    pub spilled_declares: u32,
    pub spill: SpillStats,
    /// Scratch bytes consumed by spill slots.
    pub next_spill_offset: u32,
    /// The local pass handled everything; no global scan ran.
    pub local_only: bool,
}

// =============================================================================
// Pass
// =============================================================================

pub struct RegAllocPass<'a> {
    platform: &'a Platform,
    config: RaConfig,
    pub state: RaState,
}

impl<'a> RegAllocPass<'a> {
    pub fn new(platform: &'a Platform, config: RaConfig) -> Self {
        RegAllocPass {
            platform,
            config,
            state: RaState::Init,
        }
    }

    pub fn run(&mut self, kernel: &mut Kernel) -> Result<AllocatorStats, RaError> {
        self.run_with(kernel, &mut NoopObserver)
    }

    pub fn run_with(
        &mut self,
        kernel: &mut Kernel,
        observer: &mut dyn AllocObserver,
    ) -> Result<AllocatorStats, RaError> {
        kernel.assign_lexical_ids();
        if self.config.trace {
            eprint!("{}", kernel.dump());
        }
        let mut stats = AllocatorStats::default();

        // Cheap path: locals plus trivial assignment of the rest.
        {
            let mut la = LocalAllocator::new(kernel, self.platform, &self.config);
            let mut pool = la.initial_pool();
            let out = la.run(&mut pool);
            stats.locals_assigned = out.locals_assigned;
            stats.trivially_assigned = out.trivially_assigned;
            if out.fully_allocated {
                self.state = RaState::Converged;
                stats.local_only = true;
                notify_assignments(kernel, observer);
                return Ok(stats);
            }
        }
        // The global scan owns placement from here; partial local results
        // would otherwise alias rows it hands out.
        local::undo_assignments(kernel);

        let mut layout = SpillLayout::new();
        let mut fail_safe: Option<FailSafeWindow> = None;
        let mut iter = 0u32;

        while iter < self.config.iteration_cap {
            iter += 1;
            stats.iterations = iter;
            kernel.assign_lexical_ids();
            self.state = RaState::IntervalsBuilt;

            let liveness = Liveness::compute(kernel);
            let (refs, inputs, mut pool) = {
                let mut la = LocalAllocator::new(kernel, self.platform, &self.config);
                let pool = la.initial_pool();
                (la.refs, la.input_intervals, pool)
            };
            if fail_safe.is_none() && self.config.fail_safe && iter == self.config.iteration_cap {
                // Last chance: give spill temporaries a guaranteed home.
                fail_safe = self.fail_safe_window(refs.num_rows_eot);
            }
            if let Some(fs) = fail_safe {
                pool.mark_unavailable(fs.base, fs.rows);
            }

            let mut ga =
                GlobalAllocator::new(kernel, self.platform, &self.config, &liveness, &refs, inputs);
            let outcome = match ga.run(&mut pool) {
                Ok(o) => o,
                Err(RaError::AllocationFailure { decl })
                    if self.config.fail_safe && fail_safe.is_none() =>
                {
                    // Spill temporaries (or a wide range) could not be placed;
                    // retry with the reserved window active.
                    if self.config.trace {
                        eprintln!("lsra: allocation of `{decl}` failed, enabling fail-safe");
                    }
                    drop(ga);
                    match self.fail_safe_window(refs.num_rows_eot) {
                        Some(fs) => fail_safe = Some(fs),
                        None => {
                            self.state = RaState::Failed;
                            return Err(RaError::AllocationFailure { decl });
                        }
                    }
                    local::undo_assignments(kernel);
                    continue;
                }
                Err(e) => {
                    self.state = RaState::Failed;
                    return Err(e);
                }
            };
            let intervals = std::mem::take(&mut ga.intervals);
            drop(ga);
            self.state = RaState::Allocated;

            if outcome.spilled.is_empty() {
                self.state = RaState::Converged;
                stats.globals_assigned = outcome.assigned;
                stats.next_spill_offset = layout.next_offset;
                notify_assignments(kernel, observer);
                return Ok(stats);
            }

            self.state = RaState::Spilling;
            stats.spilled_declares += outcome.spilled.len() as u32;
            if self.config.trace {
                eprintln!(
                    "lsra: iteration {iter} spilled {} declare(s)",
                    outcome.spilled.len()
                );
            }

            if let Err(e) = layout.assign(kernel, &intervals, &outcome.spilled, self.platform) {
                self.state = RaState::Failed;
                return Err(e);
            }
            for &d in &outcome.spilled {
                if let Some(disp) = kernel.decls[d].spill_disp {
                    observer.on_spill(d, disp);
                }
            }

            let mut gen = SpillCodeGenerator::new(kernel, self.platform, fail_safe);
            gen.run(&outcome.spilled);
            stats.spill.fills += gen.stats.fills;
            stats.spill.stores += gen.stats.stores;
            stats.spill.preloads += gen.stats.preloads;
            stats.spill.temps += gen.stats.temps;
            layout.seal();

            let budget = (self.config.spill_abort_ratio * kernel.inst_count() as f32) as u32;
            if stats.spill.total_insts() > budget {
                self.state = RaState::Failed;
                return Err(RaError::SpillBudgetExceeded {
                    used: stats.spill.total_insts(),
                    limit: budget,
                });
            }

            local::undo_assignments(kernel);
        }

        self.state = RaState::Failed;
        Err(RaError::IterationBudgetExceeded {
            iterations: self.config.iteration_cap,
        })
    }

    /// Rows reserved for fail-safe temporaries, just under the EOT area.
    /// None when the file is too small to set any aside.
    fn fail_safe_window(&self, num_rows_eot: u16) -> Option<FailSafeWindow> {
        let rows = (self.platform.max_msg_rows as u16 * 2).min(self.platform.num_grf / 4);
        if rows == 0 {
            return None;
        }
        let top = self.platform.num_grf - num_rows_eot;
        Some(FailSafeWindow {
            base: top.saturating_sub(rows),
            rows,
        })
    }
}

fn notify_assignments(kernel: &Kernel, observer: &mut dyn AllocObserver) {
    for (id, decl) in kernel.decls.iter() {
        if let Some(p) = decl.assignment() {
            observer.on_assign(id, p);
        }
    }
}

/// One-shot entry point.
pub fn allocate(
    kernel: &mut Kernel,
    platform: &Platform,
    config: RaConfig,
) -> Result<AllocatorStats, RaError> {
    RegAllocPass::new(platform, config).run(kernel)
}
