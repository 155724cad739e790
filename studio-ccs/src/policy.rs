//! Launch policy: the whitelists every run request must pass before the
//! runtime sees it.

use std::path::{Component, Path, PathBuf};
use studio_core::config::CcsConfig;
use studio_core::error::{ErrorKind, StudioError};
use studio_core::types::RunContainerSpec;

/// Whitelists and resource caps applied to run requests.
#[derive(Debug, Clone)]
pub struct LaunchPolicy {
    image_prefixes: Vec<String>,
    networks: Vec<String>,
    bind_roots: Vec<PathBuf>,
    device_prefixes: Vec<PathBuf>,
    max_memory_bytes: i64,
    max_nano_cpus: i64,
}

impl LaunchPolicy {
    pub fn new(
        image_prefixes: Vec<String>,
        networks: Vec<String>,
        max_memory_bytes: i64,
        max_cpus: f64,
    ) -> Self {
        Self {
            image_prefixes,
            networks,
            bind_roots: Vec::new(),
            device_prefixes: Vec::new(),
            max_memory_bytes,
            max_nano_cpus: cpus_to_nano(max_cpus),
        }
    }

    /// Host paths that bind mounts and devices may come from.
    pub fn with_host_paths(mut self, bind_roots: Vec<PathBuf>, device_prefixes: Vec<PathBuf>) -> Self {
        self.bind_roots = bind_roots;
        self.device_prefixes = device_prefixes;
        self
    }

    pub fn from_config(config: &CcsConfig) -> Self {
        Self::new(
            config.allowed_image_prefixes.clone(),
            config.allowed_networks.clone(),
            config.max_memory_bytes,
            config.max_cpus,
        )
        .with_host_paths(
            config.allowed_bind_roots.clone(),
            config.allowed_device_prefixes.clone(),
        )
    }

    /// Reject images outside the trusted prefixes.
    pub fn check_image(&self, image: &str) -> Result<(), StudioError> {
        let trusted = !image.is_empty()
            && !image.contains("..")
            && self
                .image_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && image.starts_with(prefix.as_str()));
        if trusted {
            Ok(())
        } else {
            Err(StudioError::new(
                ErrorKind::ForbiddenImage,
                format!("image '{image}' is not from a trusted registry"),
            ))
        }
    }

    /// Reject networks outside the allowlist.
    pub fn check_network(&self, network: &str) -> Result<(), StudioError> {
        if self.networks.iter().any(|n| n == network) {
            Ok(())
        } else {
            Err(StudioError::new(
                ErrorKind::ForbiddenNetwork,
                format!("network '{network}' is not allowed"),
            ))
        }
    }

    /// Reject bind sources outside the allowed host roots.
    pub fn check_bind(&self, host: &str) -> Result<(), StudioError> {
        if under_any(Path::new(host), &self.bind_roots) {
            Ok(())
        } else {
            Err(StudioError::invalid_request(format!(
                "bind mount of '{host}' is not allowed"
            )))
        }
    }

    /// Reject device nodes outside the allowed prefixes.
    pub fn check_device(&self, device: &str) -> Result<(), StudioError> {
        if under_any(Path::new(device), &self.device_prefixes) {
            Ok(())
        } else {
            Err(StudioError::invalid_request(format!(
                "device '{device}' is not allowed"
            )))
        }
    }

    /// Validate a run request and clamp its resource limits in place.
    ///
    /// The image is checked first so an untrusted image is always reported as
    /// `forbidden_image`, whatever else the request asks for.
    pub fn admit(&self, spec: &mut RunContainerSpec) -> Result<(), StudioError> {
        self.check_image(&spec.image)?;

        if spec.privileged {
            return Err(StudioError::new(
                ErrorKind::ForbiddenPrivilege,
                "privileged containers are not allowed",
            ));
        }
        if let Some(network) = &spec.network {
            self.check_network(network)?;
        }
        for volume in &spec.volumes {
            self.check_bind(&volume.host)?;
        }
        for device in &spec.devices {
            self.check_device(device)?;
        }

        let memory = spec.memory.unwrap_or(self.max_memory_bytes);
        spec.memory = Some(memory.clamp(0, self.max_memory_bytes));

        let cpus = spec.cpus.unwrap_or(nano_to_cpus(self.max_nano_cpus));
        spec.cpus = Some(nano_to_cpus(cpus_to_nano(cpus).clamp(0, self.max_nano_cpus)));
        Ok(())
    }
}

/// Absolute, free of `..`, and at or below one of `roots`. Matching is by
/// path component, so `/dev/tenstorrent-x` is not under `/dev/tenstorrent`.
fn under_any(path: &Path, roots: &[PathBuf]) -> bool {
    path.is_absolute()
        && !path.components().any(|c| matches!(c, Component::ParentDir))
        && roots
            .iter()
            .any(|root| root.is_absolute() && path.starts_with(root))
}

/// Convert fractional CPUs to the runtime's nano-CPU unit.
pub fn cpus_to_nano(cpus: f64) -> i64 {
    if cpus.is_finite() && cpus > 0.0 {
        (cpus * 1e9).round() as i64
    } else {
        0
    }
}

fn nano_to_cpus(nano: i64) -> f64 {
    nano as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_core::types::VolumeBinding;

    fn policy() -> LaunchPolicy {
        LaunchPolicy::new(
            vec!["ghcr.io/tenstorrent/".into()],
            vec!["tt_studio_network".into()],
            8 * 1024 * 1024 * 1024,
            4.0,
        )
        .with_host_paths(
            vec!["/var/lib/tt-studio".into(), "/dev/hugepages-1G".into()],
            vec!["/dev/tenstorrent".into()],
        )
    }

    fn bind(host: &str) -> VolumeBinding {
        VolumeBinding {
            host: host.into(),
            container: "/mnt".into(),
            read_only: false,
        }
    }

    fn spec(image: &str) -> RunContainerSpec {
        RunContainerSpec {
            image: image.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_untrusted_image_rejected() {
        let err = policy().admit(&mut spec("evil/registry/foo:1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenImage);
    }

    #[test]
    fn test_image_checked_before_other_fields() {
        let mut s = spec("docker.io/library/ubuntu");
        s.privileged = true;
        s.network = Some("host".into());
        let err = policy().admit(&mut s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenImage);
    }

    #[test]
    fn test_prefix_lookalike_rejected() {
        let err = policy()
            .check_image("ghcr.io/tenstorrent-evil/x:1")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenImage);
        assert!(policy().check_image("ghcr.io/tenstorrent/../x").is_err());
        assert!(policy().check_image("").is_err());
    }

    #[test]
    fn test_privileged_rejected() {
        let mut s = spec("ghcr.io/tenstorrent/x:1");
        s.privileged = true;
        assert_eq!(
            policy().admit(&mut s).unwrap_err().kind,
            ErrorKind::ForbiddenPrivilege
        );
    }

    #[test]
    fn test_network_whitelist() {
        let mut s = spec("ghcr.io/tenstorrent/x:1");
        s.network = Some("host".into());
        assert_eq!(
            policy().admit(&mut s).unwrap_err().kind,
            ErrorKind::ForbiddenNetwork
        );
        s.network = Some("tt_studio_network".into());
        assert!(policy().admit(&mut s).is_ok());
    }

    #[test]
    fn test_resources_capped() {
        let mut s = spec("ghcr.io/tenstorrent/x:1");
        s.memory = Some(i64::MAX);
        s.cpus = Some(64.0);
        policy().admit(&mut s).unwrap();
        assert_eq!(s.memory, Some(8 * 1024 * 1024 * 1024));
        assert_eq!(s.cpus, Some(4.0));

        let mut small = spec("ghcr.io/tenstorrent/x:1");
        small.cpus = Some(0.5);
        small.memory = Some(1024);
        policy().admit(&mut small).unwrap();
        assert_eq!(small.cpus, Some(0.5));
        assert_eq!(small.memory, Some(1024));
    }

    #[test]
    fn test_missing_limits_default_to_caps() {
        let mut s = spec("ghcr.io/tenstorrent/x:1");
        policy().admit(&mut s).unwrap();
        assert_eq!(s.cpus, Some(4.0));
        assert!(s.memory.is_some());
    }

    #[test]
    fn test_runtime_socket_bind_rejected() {
        let mut s = spec("ghcr.io/tenstorrent/x:1");
        s.volumes = vec![bind("/var/lib/tt-studio/cache/echo"), bind("/var/run/docker.sock")];
        let err = policy().admit(&mut s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("docker.sock"));
    }

    #[test]
    fn test_bind_sources_confined_to_roots() {
        let p = policy();
        assert!(p.check_bind("/var/lib/tt-studio/weights/llama").is_ok());
        assert!(p.check_bind("/var/lib/tt-studio").is_ok());
        assert!(p.check_bind("/dev/hugepages-1G").is_ok());
        assert!(p.check_bind("/var/lib/tt-studio/../../../etc").is_err());
        assert!(p.check_bind("/var/lib/tt-studio-other").is_err());
        assert!(p.check_bind("var/lib/tt-studio/cache").is_err());
        assert!(p.check_bind("named_volume").is_err());
        assert!(p.check_bind("/").is_err());
    }

    #[test]
    fn test_devices_confined_to_accelerators() {
        let p = policy();
        assert!(p.check_device("/dev/tenstorrent").is_ok());
        assert!(p.check_device("/dev/tenstorrent/0").is_ok());
        assert!(p.check_device("/dev/tenstorrent-evil").is_err());
        assert!(p.check_device("/dev/sda").is_err());

        let mut s = spec("ghcr.io/tenstorrent/x:1");
        s.devices = vec!["/dev/tenstorrent".into(), "/dev/mem".into()];
        assert_eq!(
            policy().admit(&mut s).unwrap_err().kind,
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn test_no_host_paths_configured_rejects_binds() {
        let p = LaunchPolicy::new(vec!["ghcr.io/tenstorrent/".into()], vec![], 1024, 1.0);
        let mut s = spec("ghcr.io/tenstorrent/x:1");
        assert!(p.admit(&mut s).is_ok());
        s.volumes = vec![bind("/var/lib/tt-studio/cache")];
        assert_eq!(p.admit(&mut s).unwrap_err().kind, ErrorKind::InvalidRequest);
    }
}
