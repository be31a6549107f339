//! The sandbox supervisor (C10) and the loopback tool bridge (C11).

mod bridge;
mod capture;
mod engine;
mod supervisor;

pub use bridge::{BridgeCallHandler, BridgeSession, ToolBridge};
pub use capture::{truncate_output, OutputCapture, TruncationDirection};
pub use engine::{CommandSandboxEngine, SandboxEngine, SandboxSpawnSpec};
pub use supervisor::{
    ExecutionOutcome, ExecutionSpec, ExecutionStatus, SandboxSupervisor, ToolCallSummary,
};
