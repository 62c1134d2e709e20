//! Build orchestration for vendored native inference runtimes.
//!
//! A run moves through four stages: capability detection (in `kiln-targets`),
//! flag resolution, the native build itself, and staging of the produced
//! libraries into every install destination. [`orchestrate`] drives the
//! stages and records each state transition in a [`RunLog`].

pub mod artifact;
pub mod error;
pub mod invoke;
pub mod pipeline;
pub mod report;
pub mod resolve;
pub mod stage;

pub use artifact::{Artifact, ArtifactManifest, ArtifactRole, ArtifactSet, ContentHash};
pub use error::{BuildError, PipelineError, ResolveError, StageError};
pub use invoke::{
    rebase, translate, BuildBackend, CancelToken, CommandToolchain, DefineStyle, Defines,
};
pub use pipeline::{error_chain, orchestrate, PipelineConfig, PipelineOutput, RunLog, RunState};
pub use report::OrchestrationReport;
pub use resolve::{
    env_flag_requests, parse_flag_request, parse_flag_state, resolve, BuildConfiguration,
    FlagRequest, FlagRequests, Provenance, RequestSource, ResolvedFlag,
};
pub use stage::{stage, PartialStagingFailure, StageOptions, StagingReport};
