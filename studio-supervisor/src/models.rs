//! The static catalog of deployable models.
//!
//! Each descriptor is compile-time data. Together they form the complete
//! whitelist of workloads the supervisor will launch.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use studio_core::error::{ErrorKind, StudioError};

/// Hardware a model implementation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Cpu,
    N150,
    N300,
    T3k,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Cpu => "cpu",
            DeviceClass::N150 => "n150",
            DeviceClass::N300 => "n300",
            DeviceClass::T3k => "t3k",
        }
    }

    /// Mesh name passed to the inference server, if any.
    pub fn mesh_device(&self) -> Option<&'static str> {
        match self {
            DeviceClass::Cpu => None,
            DeviceClass::N150 => Some("N150"),
            DeviceClass::N300 => Some("N300"),
            DeviceClass::T3k => Some("T3K"),
        }
    }

    /// Host device nodes the container needs.
    pub fn devices(&self) -> &'static [&'static str] {
        match self {
            DeviceClass::Cpu => &[],
            _ => &["/dev/tenstorrent"],
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceClass::Cpu),
            "n150" => Ok(DeviceClass::N150),
            "n300" => Ok(DeviceClass::N300),
            "t3k" => Ok(DeviceClass::T3k),
            other => Err(StudioError::invalid_request(format!(
                "unknown device class '{other}'"
            ))),
        }
    }
}

/// What a deployed model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Chat,
    ObjectDetection,
    SpeechRecognition,
}

/// A fixed volume a model needs besides the cache and weights mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StaticVolume {
    pub host: &'static str,
    pub container: &'static str,
    pub read_only: bool,
}

/// One deployable model implementation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub image: &'static str,
    pub device: DeviceClass,
    pub model_type: ModelType,
    /// Hugging Face repository the server loads by default.
    pub hf_model_id: &'static str,
    pub volumes: &'static [StaticVolume],
    pub shm_size: i64,
    /// Port the server listens on inside the container.
    pub service_port: u16,
    /// Completion route, relative to the container root.
    pub route: &'static str,
}

impl ModelDescriptor {
    /// Docker-style port key for the service port.
    pub fn port_key(&self) -> String {
        format!("{}/tcp", self.service_port)
    }
}

/// Mount point of the model cache inside every container.
pub const CONTAINER_CACHE_ROOT: &str = "/home/container_app_user/cache_root";

/// Mount point of custom weights inside the container.
pub const CONTAINER_WEIGHTS_DIR: &str = "/home/container_app_user/model_weights";

const GIB: i64 = 1024 * 1024 * 1024;

const HUGEPAGES: StaticVolume = StaticVolume {
    host: "/dev/hugepages-1G",
    container: "/dev/hugepages-1G",
    read_only: false,
};

static CATALOG: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "echo",
        display_name: "Echo (test model)",
        image: "ghcr.io/tenstorrent/dummy_echo_model:v0.0.1",
        device: DeviceClass::Cpu,
        model_type: ModelType::Chat,
        hf_model_id: "",
        volumes: &[],
        shm_size: GIB,
        service_port: 7000,
        route: "/v1/chat/completions",
    },
    ModelDescriptor {
        id: "llama-3.1-8b-instruct-n150",
        display_name: "Llama-3.1-8B-Instruct",
        image: "ghcr.io/tenstorrent/tt-inference-server/vllm-tt-metal-src-release-ubuntu-22.04-amd64:0.0.4",
        device: DeviceClass::N150,
        model_type: ModelType::Chat,
        hf_model_id: "meta-llama/Llama-3.1-8B-Instruct",
        volumes: &[HUGEPAGES],
        shm_size: 32 * GIB,
        service_port: 7000,
        route: "/v1/chat/completions",
    },
    ModelDescriptor {
        id: "llama-3.1-70b-instruct-t3k",
        display_name: "Llama-3.1-70B-Instruct",
        image: "ghcr.io/tenstorrent/tt-inference-server/vllm-tt-metal-src-release-ubuntu-22.04-amd64:0.0.4",
        device: DeviceClass::T3k,
        model_type: ModelType::Chat,
        hf_model_id: "meta-llama/Llama-3.1-70B-Instruct",
        volumes: &[HUGEPAGES],
        shm_size: 32 * GIB,
        service_port: 7000,
        route: "/v1/chat/completions",
    },
    ModelDescriptor {
        id: "qwen2.5-7b-instruct-n300",
        display_name: "Qwen2.5-7B-Instruct",
        image: "ghcr.io/tenstorrent/tt-inference-server/vllm-tt-metal-src-release-ubuntu-22.04-amd64:0.0.4",
        device: DeviceClass::N300,
        model_type: ModelType::Chat,
        hf_model_id: "Qwen/Qwen2.5-7B-Instruct",
        volumes: &[HUGEPAGES],
        shm_size: 32 * GIB,
        service_port: 7000,
        route: "/v1/chat/completions",
    },
    ModelDescriptor {
        id: "yolov4-n150",
        display_name: "YOLOv4",
        image: "ghcr.io/tenstorrent/tt-inference-server/tt-metal-yolov4-src-base:v0.0.1",
        device: DeviceClass::N150,
        model_type: ModelType::ObjectDetection,
        hf_model_id: "",
        volumes: &[HUGEPAGES],
        shm_size: 8 * GIB,
        service_port: 7000,
        route: "/objdetection_v2",
    },
    ModelDescriptor {
        id: "whisper-distil-large-v3-n150",
        display_name: "Whisper distil-large-v3",
        image: "ghcr.io/tenstorrent/tt-inference-server/tt-metal-whisper-distil-large-v3-dev:v0.0.1",
        device: DeviceClass::N150,
        model_type: ModelType::SpeechRecognition,
        hf_model_id: "distil-whisper/distil-large-v3",
        volumes: &[HUGEPAGES],
        shm_size: 8 * GIB,
        service_port: 7000,
        route: "/inference",
    },
];

/// Read-only view over the model descriptors.
#[derive(Debug, Clone, Copy)]
pub struct ModelCatalog {
    models: &'static [ModelDescriptor],
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self { models: CATALOG }
    }
}

impl ModelCatalog {
    /// A catalog over a custom descriptor table (tests, alternate builds).
    pub fn from_static(models: &'static [ModelDescriptor]) -> Self {
        Self { models }
    }

    pub fn all(&self) -> &'static [ModelDescriptor] {
        self.models
    }

    pub fn get(&self, id: &str) -> Option<&'static ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Look up a model or fail with `unknown_model`.
    pub fn require(&self, id: &str) -> Result<&'static ModelDescriptor, StudioError> {
        self.get(id).ok_or_else(|| {
            StudioError::new(ErrorKind::UnknownModel, format!("model '{id}' is not deployable"))
        })
    }
}
