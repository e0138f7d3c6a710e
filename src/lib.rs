//! Mobile Pilot - natural-language automation of mobile devices.
//!
//! The crate runs a perceive, plan, act, validate loop against a device:
//! - a [`DeviceBridge`] captures the screen and dispatches primitive input
//! - a [`Planner`] asks vision language model providers for the next action
//! - an [`ActionExecutor`] carries the action out
//! - a [`ResultValidator`] judges whether the goal holds
//! - the [`RecoveryController`] owns every retry, replan and stop decision
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mobile_pilot::{
//!     AdbBridge, DeviceRegistry, Planner, RecoveryController, VlmConfig, VlmProvider,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DeviceRegistry::new();
//! let lease = registry.acquire(Arc::new(AdbBridge::new("emulator-5554")), "example")?;
//! let provider = VlmProvider::new(VlmConfig::default())?;
//! let controller = RecoveryController::builder(lease, Planner::new(Arc::new(provider))).build()?;
//!
//! let result = controller
//!     .run_task("open the wifi settings", CancellationToken::new())
//!     .await;
//! println!("{}: {}", result.status, result.summary);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod executor;
pub mod journal;
pub mod logging;
pub mod perception;
pub mod reasoning;
pub mod task;
pub mod validator;

pub use controller::{
    LoopConfig, LoopState, ProgressCallback, ProgressEvent, RecoveryController,
    RecoveryControllerBuilder, RecoveryState, run_task,
};

pub use device::{
    AdbBridge, Bounds, DeviceBridge, DeviceLease, DeviceRegistry, KeyCode, LeaseError,
    MockDevice, MockScreen, Point, PrimitiveAction, ScreenCapture, ScreenSize, UiElement,
};

pub use error::{
    BridgeError, BridgeResult, ConfigError, ErrorKind, PlanError, ProviderError, ProviderResult,
    ValidationError,
};

pub use executor::{ActionExecutor, ExecutionFailure};
pub use journal::{JournalError, RunJournal, cleanup_old_runs, list_runs};
pub use perception::{Snapshot, SnapshotBuilder};

pub use reasoning::{
    ActionProposal, Direction, PlanRequest, Planner, ReasoningProvider, StructuredPrompt,
    StructuredResponse, SwipeMotion, TapTarget, VlmConfig, VlmProvider, check_health,
};

pub use task::{AbortReason, FailureNote, Step, StepOutcome, Task, TaskResult, TaskStatus};
pub use validator::{ModelValidator, ResultValidator, ScreenDiffValidator, ValidationRequest, Verdict};
