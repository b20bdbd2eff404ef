//! Container-runtime factory contract.
//!
//! The core routes container work through implementations of
//! [`ContainerFactory`]; the concrete Docker and Singularity factories are
//! external collaborators. The crate ships the trivial
//! [`NoContainerFactory`] for engines running against locally installed
//! software.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use tracing::{error, instrument};

use crate::error::ContainerError;
use crate::types::{Container, ContainerKind};

/// The contract each container runtime implements.
#[async_trait]
pub trait ContainerFactory: Send + Sync {
    fn container_type(&self) -> ContainerKind;

    /// Version string of the underlying runtime.
    async fn engine_version(&self) -> Result<String>;

    /// `(operating_system, architecture)` of the runtime host.
    async fn architecture(&self) -> Result<(String, String)>;

    /// Whether the runtime advertises a capability such as `"userns"`.
    fn supports(&self, feature: &str) -> bool;

    /// Materialize each tagged image into the shared image cache (or copy
    /// it from an injectable bundle), then plant an engine-convention-named
    /// symlink inside `containers_dir`.
    async fn materialize(
        &self,
        tags: &[String],
        containers_dir: &Path,
        offline: bool,
        force: bool,
        injectable: &[Container],
    ) -> Result<Vec<Container>>;

    /// Register images into the local runtime: a no-op for file-based
    /// runtimes, a `load` for daemon-based ones.
    async fn deploy(
        &self,
        containers: &[Container],
        containers_dir: Option<&Path>,
        force: bool,
    ) -> Result<Vec<Container>>;
}

/// The "no container" approach, for development and locally installed
/// software. Materialization is a no-op.
pub struct NoContainerFactory;

#[async_trait]
impl ContainerFactory for NoContainerFactory {
    fn container_type(&self) -> ContainerKind {
        ContainerKind::NoContainer
    }

    async fn engine_version(&self) -> Result<String> {
        Ok("none".into())
    }

    async fn architecture(&self) -> Result<(String, String)> {
        Ok((
            std::env::consts::OS.to_string(),
            std::env::consts::ARCH.to_string(),
        ))
    }

    fn supports(&self, _feature: &str) -> bool {
        false
    }

    async fn materialize(
        &self,
        _tags: &[String],
        _containers_dir: &Path,
        _offline: bool,
        _force: bool,
        _injectable: &[Container],
    ) -> Result<Vec<Container>> {
        Ok(Vec::new())
    }

    async fn deploy(
        &self,
        containers: &[Container],
        _containers_dir: Option<&Path>,
        _force: bool,
    ) -> Result<Vec<Container>> {
        Ok(containers.to_vec())
    }
}

/// Registry of container factories, keyed by runtime.
#[derive(Default)]
pub struct ContainerFactoryRegistry {
    factories: HashMap<ContainerKind, Arc<dyn ContainerFactory>>,
}

impl ContainerFactoryRegistry {
    /// A registry holding only the no-container factory.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(NoContainerFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ContainerFactory>) {
        self.factories.insert(factory.container_type(), factory);
    }

    pub fn get(&self, kind: ContainerKind) -> Result<Arc<dyn ContainerFactory>> {
        self.factories
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                ContainerError::NotRegistered {
                    kind: kind.to_string(),
                }
                .into()
            })
    }
}

/// Validate a runtime choice against the execution flags.
///
/// Secure execution with Singularity needs either user namespaces or FUSE
/// `user_allow_other`; without them the run cannot read the encrypted
/// overlay, so a diagnostic is emitted. Combining secure execution with
/// writable containers on Singularity is fatal.
#[instrument(skip(factory))]
pub fn check_secure_exec(
    factory: &dyn ContainerFactory,
    secure_exec: bool,
    allow_other: bool,
    writable_containers: bool,
) -> Result<()> {
    if factory.container_type() != ContainerKind::Singularity {
        return Ok(());
    }

    if secure_exec {
        let userns = factory.supports("userns");
        if !allow_other && !userns {
            error!(
                "secure executions do not work without either FUSE user_allow_other or userns in the singularity installation"
            );
        }
        if writable_containers {
            return Err(ContainerError::SecureWritableConflict.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    struct FakeSingularity;

    #[async_trait]
    impl ContainerFactory for FakeSingularity {
        fn container_type(&self) -> ContainerKind {
            ContainerKind::Singularity
        }
        async fn engine_version(&self) -> Result<String> {
            Ok("singularity 3.8".into())
        }
        async fn architecture(&self) -> Result<(String, String)> {
            Ok(("linux".into(), "x86_64".into()))
        }
        fn supports(&self, _feature: &str) -> bool {
            false
        }
        async fn materialize(
            &self,
            _tags: &[String],
            _containers_dir: &Path,
            _offline: bool,
            _force: bool,
            _injectable: &[Container],
        ) -> Result<Vec<Container>> {
            Ok(Vec::new())
        }
        async fn deploy(
            &self,
            containers: &[Container],
            _containers_dir: Option<&Path>,
            _force: bool,
        ) -> Result<Vec<Container>> {
            Ok(containers.to_vec())
        }
    }

    #[test]
    fn secure_writable_singularity_is_fatal() {
        let err = check_secure_exec(&FakeSingularity, true, false, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::SecureWritableConflict)
        ));
    }

    #[test]
    fn insecure_singularity_passes() {
        check_secure_exec(&FakeSingularity, false, false, true).unwrap();
    }

    #[tokio::test]
    async fn no_container_factory_is_a_no_op() {
        let factory = NoContainerFactory;
        let temp = tempfile::tempdir().unwrap();
        let containers = factory
            .materialize(&["ubuntu:22.04".into()], temp.path(), false, false, &[])
            .await
            .unwrap();
        pretty_assert_eq!(containers, Vec::<Container>::new());
    }
}
