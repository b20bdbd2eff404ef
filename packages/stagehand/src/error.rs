//! Error taxonomy for the enactment core.
//!
//! Every fallible API in this crate returns [`color_eyre::Result`]; the enums
//! here are the typed layer underneath. They convert into `eyre::Report`
//! through `?`, and callers that need to branch on a failure family (an
//! offline cache miss, a damaged instance) downcast with
//! [`color_eyre::Report::downcast_ref`].

use std::path::PathBuf;

use thiserror::Error;

/// Problems with the staging configuration itself, before any work happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workflow id {workflow_id:?} is not an absolute URI and no TRS endpoint is configured")]
    MissingTrsEndpoint { workflow_id: String },

    #[error("staging definition does not validate against its schema:\n{}", violations.join("\n"))]
    SchemaValidation { violations: Vec<String> },

    #[error("security context {name:?} is required by {needed_by} but missing from the credentials table")]
    UnknownSecurityContext { name: String, needed_by: String },

    #[error("unrecognized input class {class:?} attached to {linear_key:?}")]
    UnrecognizedInputClass { class: String, linear_key: String },

    #[error("unexpected export item selector {selector:?}")]
    MalformedExportItem { selector: String },
}

/// Failures while mapping a workflow reference to an identified repository.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("unable to identify a TRS version from {endpoint}")]
    Protocol { endpoint: String },

    #[error("tool {workflow_id:?} at {endpoint} is not labelled as a workflow")]
    NotAWorkflow { workflow_id: String, endpoint: String },

    #[error("version {version:?} of workflow {workflow_id:?} was not found at {endpoint}")]
    VersionNotFound {
        workflow_id: String,
        version: String,
        endpoint: String,
    },

    #[error("descriptor type {descriptor:?} is not available for version {version:?} of workflow {workflow_id:?}")]
    DescriptorTypeNotAvailable {
        workflow_id: String,
        version: String,
        descriptor: String,
    },

    #[error("descriptor type {descriptor:?} is not recognized by this backend")]
    DescriptorTypeNotRecognized { descriptor: String },

    #[error("programming language {language_id:?} (url {language_url:?}) does not match any registered workflow engine")]
    UnknownLanguage {
        language_id: Option<String>,
        language_url: Option<String>,
    },

    #[error("unable to derive a git repository from {uri}")]
    UnsupportedGitHost { uri: String },

    #[error("TRS tool at {uri} declares no workflow entrypoint")]
    Unresolvable { uri: String },
}

/// Failures while dereferencing and materializing remote content.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {uri}")]
    Timeout { uri: String },

    #[error("HTTP status {status} fetching {uri}")]
    HttpStatus { status: u16, uri: String },

    #[error("checksum mismatch for {uri}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        uri: String,
        expected: String,
        computed: String,
    },

    #[error("offline mode and {uri} is not present in the cache")]
    CacheMiss { uri: String },

    #[error("no fetcher registered for scheme {scheme:?} (uri {uri})")]
    UnknownScheme { scheme: String, uri: String },

    #[error("too many dereference hops resolving {uri}")]
    TooManyHops { uri: String },
}

/// Failures while provisioning the instance working directory.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot mount encrypted overlay at {mount_point} with {command:?}")]
    MountFailed {
        mount_point: PathBuf,
        command: String,
    },

    #[error("cannot unmount {mount_point} (exit {exit:?})")]
    UnmountFailed {
        mount_point: PathBuf,
        exit: Option<i32>,
    },

    #[error("staged working directory {work_dir} is incomplete")]
    IncompleteWorkdir { work_dir: PathBuf },

    #[error("raw working directory {raw_dir} is owned by another live instance")]
    WorkdirBusy { raw_dir: PathBuf },
}

/// Failures in the workflow-engine adapter layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no registered engine recognized a workflow at {location}")]
    NotRecognized { location: String },

    #[error("engine kind {kind} is not registered")]
    NotRegistered { kind: String },

    #[error("engine {kind} version {version:?} is unavailable")]
    VersionUnavailable { kind: String, version: String },

    #[error("workflow exited with code {exit_code}")]
    NonZeroExit { exit_code: i64 },
}

/// Failures in the container runtime layer.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("cannot pull container image {tag:?}")]
    PullFailed { tag: String },

    #[error("image {tag:?} is built for {image_arch}, host is {host_arch}")]
    ArchMismatch {
        tag: String,
        image_arch: String,
        host_arch: String,
    },

    #[error("container runtime {runtime} lacks required capability {capability:?}")]
    CapabilityMissing { runtime: String, capability: String },

    #[error("secure execution and writable containers are incompatible with singularity")]
    SecureWritableConflict,

    #[error("no container factory registered for {kind}")]
    NotRegistered { kind: String },
}

/// Failures while pushing staged artifacts through an export plugin.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export plugin {plugin_id:?} is not registered")]
    UnknownPlugin { plugin_id: String },

    #[error("export plugin {plugin_id:?} rejected the upload: {reason}")]
    PluginRejection { plugin_id: String, reason: String },

    #[error("security context {context:?} was not supplied for export action {action_id:?}")]
    MissingCredentials { context: String, action_id: String },

    #[error("{what} {name:?} selected for export does not exist")]
    UnknownItem { what: String, name: String },

    #[error("export plugin {plugin_id:?} does not implement the draft lifecycle")]
    DraftUnsupported { plugin_id: String },

    #[error("export actions failed: {summary}")]
    ActionsFailed { summary: String },
}

/// Violations of the lifecycle state machine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot {operation} before the {prerequisite} stage has been marshalled")]
    MissingPrerequisite {
        operation: String,
        prerequisite: String,
    },

    #[error("instance {instance_id} is damaged")]
    Damaged { instance_id: String },

    #[error("marshalled {stage} record already exists")]
    AlreadyMarshalled { stage: String },
}
