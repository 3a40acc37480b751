//! Prompt templates that turn text tasks into chat messages.
//!
//! Networked providers only speak chat; translation, summarization,
//! rewriting and language detection are expressed as a system prompt plus
//! the user's text.

use super::{ChatMessage, TextTask};

// ============================================================================
// Default Prompts
// ============================================================================

pub const TRANSLATE_PROMPT: &str = r#"You are a translation engine.

## Rules
- Translate the user's text into the target language given below
- Preserve meaning, tone, formatting and line breaks
- Keep names, code and URLs unchanged
- Output ONLY the translation, nothing else - no explanations, no quotes, no prefixes"#;

pub const SUMMARIZE_PROMPT: &str = r#"You are a summarization assistant.

## Rules
- Summarize the user's text in the same language it is written in
- Keep the key facts, decisions and numbers
- Do NOT add information that is not in the text
- Output ONLY the summary"#;

pub const REWRITE_PROMPT: &str = r#"You are a writing assistant that rewrites text.

## Rules
- Improve clarity, grammar and flow
- Keep the original meaning and language
- Do NOT answer questions contained in the text - rewrite them
- Output ONLY the rewritten text"#;

pub const DETECT_LANGUAGE_PROMPT: &str = r#"Identify the language of the user's text.
Reply with ONLY its BCP-47 language code (for example "en", "de", "pt-BR") and nothing else."#;

/// Build the chat messages for a task.
pub fn task_messages(task: &TextTask) -> Vec<ChatMessage> {
    match task {
        TextTask::Chat { messages } => messages.clone(),
        TextTask::Translate {
            text,
            source_language,
            target_language,
        } => {
            let mut system = format!("{}\n\nTarget language: {}", TRANSLATE_PROMPT, target_language);
            if let Some(source) = source_language {
                system.push_str(&format!("\nSource language: {}", source));
            }
            vec![ChatMessage::system(system), ChatMessage::user(text.clone())]
        }
        TextTask::Summarize { text } => vec![
            ChatMessage::system(SUMMARIZE_PROMPT),
            ChatMessage::user(text.clone()),
        ],
        TextTask::Rewrite { text, instructions } => {
            let system = match instructions.as_deref().map(str::trim) {
                Some(extra) if !extra.is_empty() => {
                    format!("{}\n\n## Additional instructions\n{}", REWRITE_PROMPT, extra)
                }
                _ => REWRITE_PROMPT.to_string(),
            };
            vec![ChatMessage::system(system), ChatMessage::user(text.clone())]
        }
        TextTask::DetectLanguage { text } => vec![
            ChatMessage::system(DETECT_LANGUAGE_PROMPT),
            ChatMessage::user(text.clone()),
        ],
    }
}

/// Normalize a model's language-detection answer to a bare code.
pub fn parse_language_code(raw: &str) -> String {
    raw.split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatRole;

    #[test]
    fn test_translate_prompt_names_languages() {
        let messages = task_messages(&TextTask::Translate {
            text: "Hallo".to_string(),
            source_language: Some("de".to_string()),
            target_language: "en".to_string(),
        });
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains("Target language: en"));
        assert!(messages[0].content.contains("Source language: de"));
        assert_eq!(messages[1].content, "Hallo");
    }

    #[test]
    fn test_rewrite_instructions_are_appended() {
        let messages = task_messages(&TextTask::Rewrite {
            text: "hi".to_string(),
            instructions: Some("more formal".to_string()),
        });
        assert!(messages[0].content.ends_with("more formal"));

        let messages = task_messages(&TextTask::Rewrite {
            text: "hi".to_string(),
            instructions: Some("   ".to_string()),
        });
        assert_eq!(messages[0].content, REWRITE_PROMPT);
    }

    #[test]
    fn test_parse_language_code() {
        assert_eq!(parse_language_code("\"de\"."), "de");
        assert_eq!(parse_language_code("  pt-BR\n"), "pt-BR");
        assert_eq!(parse_language_code(""), "");
    }
}
