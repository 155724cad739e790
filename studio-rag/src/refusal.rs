//! Refusal phrases and the standard refusal message.

/// Phrases that mark a model reply as an explicit refusal. Matched against
/// the lowercased reply.
pub const REFUSAL_PHRASES: &[&str] = &[
    "i cannot answer this based on the provided documents",
    "i can't answer this based on the provided documents",
    "i cannot answer based on the provided documents",
    "the documents don't contain",
    "the documents do not contain",
    "the provided documents do not",
    "the provided documents don't",
    "not mentioned in the provided documents",
    "i don't have enough information",
    "i do not have enough information",
];

/// Instruction telling the model how to refuse.
pub const REFUSAL_INSTRUCTION: &str = "If the documents do not contain the answer, reply exactly: \"I cannot answer this based on the provided documents.\"";

pub fn is_refusal(response: &str) -> bool {
    let lowered = response.to_lowercase();
    REFUSAL_PHRASES.iter().any(|p| lowered.contains(p))
}

/// The message returned instead of an ungrounded answer.
pub fn refusal_message(query: &str) -> String {
    format!(
        "I couldn't find enough reliable information in your documents to answer: \"{query}\"\n\n\
         You could try:\n\
         - uploading documents that cover this topic\n\
         - rephrasing the question with more specific terms\n\
         - asking about something the current documents discuss"
    )
}
