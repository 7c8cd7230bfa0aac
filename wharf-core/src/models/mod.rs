//! Persistent & in-memory data model of the orchestration core.

mod app;
mod build;
mod cluster;
mod process;
mod release;

pub use app::{AppType, Application, Environment, Module, ModuleEnvironment, RuntimeConfig, RuntimeSpec, WlApp};
pub use build::{Build, BuildProcess, BuildStatus, Buildpack, BuildpackKind, SourceBlob};
pub use cluster::{Cluster, ClusterState, Domain, EgressRule, EgressSpec, IngressConfig, RCStateAppBinding};
pub use process::{computed_replicas, ProcessSpec, ProcessTmpl, ScalingConfig, TargetStatus};
pub use release::{AppModelDeploy, Deployment, DeployStatus, Release, ReleasePhase};
