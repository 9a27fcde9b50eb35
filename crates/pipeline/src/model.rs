//! Model-name parsing (§4.E step 3): clients may suffix a model id with `@<level>` to
//! request a thinking-budget hint without a dedicated request field.

const THINKING_LEVELS: &[&str] = &["low", "medium", "high"];

/// Splits `model@level` into `(model, Some(level))`, validating `level` against the known
/// set; an unrecognized or absent suffix leaves the model name untouched.
pub fn parse_model_and_thinking_level(raw_model: &str) -> (String, Option<String>) {
    match raw_model.rsplit_once('@') {
        Some((model, level)) if THINKING_LEVELS.contains(&level) => {
            (model.to_string(), Some(level.to_string()))
        }
        _ => (raw_model.to_string(), None),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_recognized_level_suffix() {
        let (model, level) = parse_model_and_thinking_level("gemini-2.5-flash@high");
        assert_eq!(model, "gemini-2.5-flash");
        assert_eq!(level.as_deref(), Some("high"));
    }

    #[test]
    fn leaves_model_without_suffix_untouched() {
        let (model, level) = parse_model_and_thinking_level("gemini-2.5-flash");
        assert_eq!(model, "gemini-2.5-flash");
        assert_eq!(level, None);
    }

    #[test]
    fn unrecognized_suffix_is_not_split() {
        let (model, level) = parse_model_and_thinking_level("gemini-2.5-flash@turbo");
        assert_eq!(model, "gemini-2.5-flash@turbo");
        assert_eq!(level, None);
    }

    #[test]
    fn at_sign_in_model_name_without_known_level_is_preserved() {
        let (model, level) = parse_model_and_thinking_level("org@gemini-2.5-flash");
        assert_eq!(model, "org@gemini-2.5-flash");
        assert_eq!(level, None);
    }
}
