pub mod abi;
pub mod asm;
pub mod cli;
pub mod effects;
pub mod engine;
pub mod evm;
pub mod explorer;
pub mod expr;
pub mod format;
pub mod invariant;
pub mod limiter;
pub mod op;
pub mod scenario;
pub mod smt;
pub mod solvers;
pub mod types;
