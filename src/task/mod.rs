//! Task data model and in-flight tracking.
//!
//! - [`model`]: events, packages, capabilities, validation results and responses
//! - [`params`]: decoded parameter objects and the [`Substitutable`] contract
//! - [`tracker`]: the validating/executing maps every component coordinates through

pub mod model;
pub mod params;
pub mod tracker;

pub use model::{
    Capability, EncryptedRecord, EncryptionConfig, Owner, SecretBundle, SecretReference, Task,
    TaskEvent, TaskPackage, TaskResponse, TaskStatus, ValidationResult,
};
pub use params::{ShellParameters, Substitutable, TaskParameters, SHELL_SCRIPT};
pub use tracker::{AcquireGuard, Stage, TaskHandle, TaskSummary, TaskTracker};
