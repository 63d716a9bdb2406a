//! Tutor instruction builder for upstream sessions.

use lingua_core::config::UpstreamConfig;
use lingua_core::session::{AssistMode, SessionConfig};

use crate::{LiveSessionParams, Modality, PCM_INPUT_MIME};

const FALLBACK_TUTOR: &str = "You are a friendly language tutor.";

const BRIEF_REPLIES: &str =
    "Keep responses brief (2-3 sentences) so the conversation flows naturally.";

/// Persona line for a target language, matched case-insensitively.
fn tutor_persona(language: &str) -> Option<&'static str> {
    let persona = match language.trim().to_ascii_lowercase().as_str() {
        "spanish" => "You are a friendly Spanish tutor from Spain or Latin America. \
                      Speak naturally in Spanish with a conversational tone.",
        "french" => "You are a friendly French tutor from France. \
                     Speak naturally in French with a conversational tone.",
        "german" => "You are a friendly German tutor from Germany. \
                     Speak naturally in German with a conversational tone.",
        "italian" => "You are a friendly Italian tutor from Italy. \
                      Speak naturally in Italian with a conversational tone.",
        "portuguese" => "You are a friendly Portuguese tutor from Brazil or Portugal. \
                         Speak naturally in Portuguese with a conversational tone.",
        "hindi" => "You are a friendly Hindi tutor. Speak in a natural Mumbai/Delhi dialect.",
        "chinese" | "mandarin" => "You are a friendly Mandarin Chinese tutor. \
                                   Speak naturally in Mandarin with a conversational tone.",
        "japanese" => "You are a friendly Japanese tutor from Japan. \
                       Speak naturally in Japanese with a conversational tone.",
        "korean" => "You are a friendly Korean tutor from South Korea. \
                     Speak naturally in Korean with a conversational tone.",
        _ => return None,
    };
    Some(persona)
}

fn mode_guidance(mode: AssistMode) -> &'static str {
    match mode {
        AssistMode::Assisted => {
            "Mode: Assisted. Gently correct the learner's mistakes and offer short tips."
        }
        AssistMode::NonAssisted => {
            "Mode: Non-Assisted. Do not correct mistakes; just keep a natural conversation going."
        }
    }
}

/// Build the system instruction for a session.
pub fn build_system_instruction(config: &SessionConfig) -> String {
    let mut parts = Vec::new();

    match tutor_persona(&config.language) {
        Some(persona) => {
            parts.push(persona.to_string());
            parts.push(BRIEF_REPLIES.to_string());
        }
        None => parts.push(FALLBACK_TUTOR.to_string()),
    }

    parts.push(format!(
        "Focus the conversation on: {}. Use relevant vocabulary naturally.",
        config.topic
    ));
    parts.push(mode_guidance(config.mode).to_string());

    parts.join("\n")
}

/// Hidden opening turn that makes the assistant speak first.
pub fn build_greeting(config: &SessionConfig) -> String {
    format!(
        "The learner has just connected. Greet them in {} and open a short conversation about {}.",
        config.language, config.topic
    )
}

/// Derive upstream session parameters from the client's config.
pub fn build_session_params(config: &SessionConfig, upstream: &UpstreamConfig) -> LiveSessionParams {
    let mut response_modalities: Vec<Modality> = upstream
        .response_modalities
        .iter()
        .filter_map(|m| Modality::parse(m))
        .collect();
    response_modalities.dedup();
    if response_modalities.is_empty() {
        response_modalities.push(Modality::Audio);
    }

    LiveSessionParams {
        model: upstream.model.clone(),
        response_modalities,
        voice: upstream.voice.clone(),
        system_instruction: build_system_instruction(config),
        input_mime_type: PCM_INPUT_MIME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingua_core::session::AudioFormat;

    fn config(language: &str, topic: &str, mode: AssistMode) -> SessionConfig {
        SessionConfig {
            language: language.into(),
            topic: topic.into(),
            mode,
            format: AudioFormat::Pcm,
        }
    }

    #[test]
    fn test_known_language_instruction() {
        let text = build_system_instruction(&config("Spanish", "Travel", AssistMode::Assisted));
        assert!(text.starts_with("You are a friendly Spanish tutor"));
        assert!(text.contains("Focus the conversation on: Travel."));
        assert!(text.contains("Mode: Assisted."));
    }

    #[test]
    fn test_language_match_is_case_insensitive() {
        let text = build_system_instruction(&config("japanese", "Food", AssistMode::NonAssisted));
        assert!(text.contains("Japanese tutor"));
        assert!(text.contains("Do not correct mistakes"));
    }

    #[test]
    fn test_unknown_language_falls_back() {
        let text = build_system_instruction(&config("Klingon", "Space", AssistMode::Assisted));
        assert!(text.starts_with(FALLBACK_TUTOR));
        assert!(text.contains("Space"));
    }

    #[test]
    fn test_session_params_from_upstream_config() {
        let upstream = UpstreamConfig {
            response_modalities: vec!["audio".into(), "TEXT".into(), "bogus".into()],
            voice: "Kore".into(),
            ..UpstreamConfig::default()
        };
        let params =
            build_session_params(&config("French", "Music", AssistMode::Assisted), &upstream);
        assert_eq!(params.model, "models/gemini-2.0-flash-exp");
        assert_eq!(params.voice, "Kore");
        assert_eq!(
            params.response_modalities,
            vec![Modality::Audio, Modality::Text]
        );
        assert_eq!(params.input_mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_empty_modalities_default_to_audio() {
        let upstream = UpstreamConfig {
            response_modalities: vec![],
            ..UpstreamConfig::default()
        };
        let params =
            build_session_params(&config("German", "Work", AssistMode::Assisted), &upstream);
        assert_eq!(params.response_modalities, vec![Modality::Audio]);
    }

    #[test]
    fn test_greeting_mentions_language_and_topic() {
        let greeting = build_greeting(&config("Korean", "Sports", AssistMode::Assisted));
        assert!(greeting.contains("Korean"));
        assert!(greeting.contains("Sports"));
    }
}
