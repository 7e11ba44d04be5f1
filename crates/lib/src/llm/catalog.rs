//! Pullable model catalog and id filtering.

use regex::RegexBuilder;

use super::{GatewayError, ModelDescriptor};

/// Popular models on the Ollama library that are known to pull cleanly.
/// Replaced by `ollama.catalog` in the config when that list is non-empty.
pub const DEFAULT_CATALOG: &[&str] = &[
    "llama3.2",
    "llama3.2:3b",
    "mistral",
    "gemma2",
    "qwen2.5",
    "phi3",
    "codellama",
    "deepseek-coder",
    "llama3.1",
    "mixtral",
];

/// Keep descriptors whose id matches `pattern` (case-insensitive regex search), in source order.
/// An empty or absent pattern keeps everything. The pattern is compiled before anything else,
/// so an invalid one fails without touching the input.
pub fn filter_descriptors(
    descriptors: Vec<ModelDescriptor>,
    pattern: Option<&str>,
) -> Result<Vec<ModelDescriptor>, GatewayError> {
    let pattern = match pattern.map(str::trim) {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(descriptors),
    };
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| GatewayError::InvalidFilter(e.to_string()))?;
    let matched: Vec<ModelDescriptor> = descriptors
        .into_iter()
        .filter(|d| re.is_match(&d.id))
        .collect();
    log::debug!("filter {:?} matched {} model(s)", pattern, matched.len());
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[ModelDescriptor]) -> Vec<&str> {
        v.iter().map(|d| d.id.as_str()).collect()
    }

    fn descriptors(names: &[&str]) -> Vec<ModelDescriptor> {
        names.iter().map(|n| ModelDescriptor::remote(*n)).collect()
    }

    #[test]
    fn filter_keeps_source_order() {
        let all = descriptors(&["llama3", "gpt-oss", "gpt-mini"]);
        let out = filter_descriptors(all, Some("gpt")).unwrap();
        assert_eq!(ids(&out), vec!["gpt-oss", "gpt-mini"]);
    }

    #[test]
    fn filter_is_case_insensitive() {
        let all = descriptors(&["Mistral", "llama3"]);
        let out = filter_descriptors(all, Some("MISTRAL")).unwrap();
        assert_eq!(ids(&out), vec!["Mistral"]);
    }

    #[test]
    fn empty_result_is_ok() {
        let out = filter_descriptors(descriptors(&["llama3"]), Some("phi")).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn blank_pattern_keeps_all() {
        let out = filter_descriptors(descriptors(&["a", "b"]), Some("  ")).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = filter_descriptors(descriptors(&["a"]), Some("llama(")).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidFilter(_)));
    }
}
