pub mod arbitrage;
pub mod machine;
pub mod persistence;
pub mod state;
pub mod timing;

pub use arbitrage::{ArbitrageCalculation, ArbitrageInput, ArbitrageOutcome, NotFeasible};
pub use machine::{MachineConfig, OptimizerDeps, PeakExportOptimizer};
pub use persistence::OptimizerStore;
pub use state::*;
pub use timing::{evaluate_dump_timing, recover_phase, DumpTiming, DumpTimingInput, Recovery};
