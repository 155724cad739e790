//! Documents seeded into the internal knowledge collection.

/// One built-in document.
#[derive(Debug, Clone, Copy)]
pub struct CorpusDocument {
    pub id: &'static str,
    pub title: &'static str,
    pub text: &'static str,
}

pub const INTERNAL_KNOWLEDGE: &[CorpusDocument] = &[
    CorpusDocument {
        id: "tt-studio-overview",
        title: "What TT Studio is",
        text: "TT Studio is a local control plane for Tenstorrent hardware. It deploys model \
               containers on the appliance, streams chat completions from them with time to \
               first token and time per output token measurements, and answers questions over \
               uploaded documents with retrieval augmented generation.",
    },
    CorpusDocument {
        id: "tt-studio-deploy",
        title: "Deploying a model",
        text: "To deploy a model, pick it from the model catalog and press deploy. The \
               supervisor reserves a host port, launches the container on the studio network \
               and records the deployment as running once the container starts. Stopping a \
               deployment removes its container and frees the port. Deploying the same model \
               again creates a new deployment with a new id.",
    },
    CorpusDocument {
        id: "tt-studio-hardware",
        title: "Supported devices",
        text: "Models are built for a device class. The N150 card has a single Wormhole chip, \
               the N300 card has two Wormhole chips, and a T3K system links eight chips \
               together. Echo and test models run on the CPU. A model only deploys on the \
               device class it was compiled for.",
    },
    CorpusDocument {
        id: "tt-studio-weights",
        title: "Custom weights",
        text: "A deployment can load fine-tuned weights instead of the default checkpoint. \
               Give both a weights id and a weights path relative to the weights directory. \
               Supplying only one of the two is rejected as a weights mismatch.",
    },
    CorpusDocument {
        id: "tt-studio-rag",
        title: "Document questions",
        text: "Uploaded documents are split into chunks, embedded and stored in a collection. \
               A question retrieves the closest chunks and drops those farther than the \
               distance threshold. If nothing relevant survives, or the answer is not supported \
               by the retrieved text, TT Studio refuses instead of guessing and suggests \
               uploading more documents or rephrasing the question.",
    },
    CorpusDocument {
        id: "tt-studio-metrics",
        title: "Inference metrics",
        text: "Every chat response ends with a metrics record. TTFT is the time from sending \
               the request to the first generated token. TPOT is the average time between \
               generated tokens and is also reported as a median and percentiles. The record \
               includes the number of prompt tokens, generated tokens and the context length.",
    },
    CorpusDocument {
        id: "tt-studio-troubleshooting",
        title: "When a deployment disappears",
        text: "If a model container exits on its own, the reconciler notices within a few \
               seconds, marks the deployment as exited or dead and frees its port. Deployments \
               you stopped yourself stay stopped. If the container service is unreachable the \
               reconciler waits and retries without changing any deployment.",
    },
];
