use crate::providers::ProviderKind;
use crate::specs::gemini::{GeminiChunk, GeminiPart};
use crate::specs::openai::OpenAiChunk;
use crate::types::*;
use serde_json::Value;

/// What a single reduced payload means for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceSignal {
    /// First contributing chunk of the stream.
    Created,
    /// A later chunk extended the accumulated state.
    Updated,
    /// The payload carried nothing we surface (role-only delta, empty
    /// candidate, unparseable event).
    Ignored,
}

/// Folds decoded stream payloads into accumulated answer and thought text.
/// One reducer per request; it owns the full accumulated state so every
/// notification downstream can carry the whole text, not a delta.
#[derive(Debug)]
pub struct ResponseReducer {
    kind: ProviderKind,
    started: bool,
    answer: String,
    thoughts: String,
    grounding: Option<Value>,
    response_id: Option<String>,
    model_id: Option<String>,
    parse_failures: u64,
}

impl ResponseReducer {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            started: false,
            answer: String::new(),
            thoughts: String::new(),
            grounding: None,
            response_id: None,
            model_id: None,
            parse_failures: 0,
        }
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn thoughts(&self) -> &str {
        &self.thoughts
    }

    pub fn grounding(&self) -> Option<&Value> {
        self.grounding.as_ref()
    }

    /// Upstream-reported response id, when the schema carries one.
    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Upstream-reported model id, which can differ from the configured name.
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    /// Folds one decoded SSE payload. A malformed payload is counted and
    /// ignored; an error object embedded in the 200 stream is terminal.
    pub fn reduce(&mut self, payload: &str) -> Result<ReduceSignal> {
        match self.kind {
            ProviderKind::OpenAiCompat => self.reduce_openai(payload),
            ProviderKind::Gemini => self.reduce_gemini(payload),
        }
    }

    /// Folds a complete non-streaming response body. Gemini uses the same
    /// shape for both; the chat-completions schema swaps `delta` for
    /// `message`, so that path reads the full body directly.
    pub fn reduce_full(&mut self, body: &str) -> Result<ReduceSignal> {
        match self.kind {
            ProviderKind::Gemini => self.reduce_gemini(body),
            ProviderKind::OpenAiCompat => {
                let value: Value = match serde_json::from_str(body) {
                    Ok(v) => v,
                    Err(e) => {
                        self.parse_failures += 1;
                        tracing::warn!("[REDUCE] Unparseable response body: {}", e);
                        return Ok(ReduceSignal::Ignored);
                    }
                };
                if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                    return Err(Self::model_error(error));
                }
                self.capture_identity(
                    value.get("id").and_then(Value::as_str),
                    value.get("model").and_then(Value::as_str),
                );
                let choice = &value["choices"][0];
                if let Some(error) = choice.get("error").filter(|e| !e.is_null()) {
                    return Err(Self::model_error(error));
                }
                let message = &choice["message"];
                let mut contributed = false;
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    contributed |= self.push_answer(text);
                }
                let reasoning = message
                    .get("reasoning_content")
                    .or_else(|| message.get("reasoning"))
                    .and_then(Value::as_str);
                if let Some(text) = reasoning {
                    contributed |= self.push_thoughts(text);
                }
                Ok(self.signal(contributed))
            }
        }
    }

    fn reduce_openai(&mut self, payload: &str) -> Result<ReduceSignal> {
        let chunk: OpenAiChunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => {
                self.parse_failures += 1;
                tracing::warn!(
                    "[REDUCE] Unparseable chunk, skipping: {} ({})",
                    e,
                    crate::str_utils::first_n_chars_lossy(payload, 120)
                );
                return Ok(ReduceSignal::Ignored);
            }
        };

        if let Some(error) = chunk.error.filter(|e| !e.is_null()) {
            return Err(Self::model_error(&error));
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(ReduceSignal::Ignored);
        };
        if let Some(error) = choice.error.filter(|e| !e.is_null()) {
            return Err(Self::model_error(&error));
        }

        self.capture_identity(
            (!chunk.id.is_empty()).then_some(chunk.id.as_str()),
            (!chunk.model.is_empty()).then_some(chunk.model.as_str()),
        );

        let mut contributed = false;
        if let Some(text) = choice.delta.content.as_deref() {
            contributed |= self.push_answer(text);
        }
        if let Some(text) = choice.delta.reasoning_delta() {
            contributed |= self.push_thoughts(text);
        }
        Ok(self.signal(contributed))
    }

    fn reduce_gemini(&mut self, payload: &str) -> Result<ReduceSignal> {
        let chunk: GeminiChunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => {
                self.parse_failures += 1;
                tracing::warn!(
                    "[REDUCE] Unparseable chunk, skipping: {} ({})",
                    e,
                    crate::str_utils::first_n_chars_lossy(payload, 120)
                );
                return Ok(ReduceSignal::Ignored);
            }
        };

        if let Some(error) = chunk.error.filter(|e| !e.is_null()) {
            return Err(Self::model_error(&error));
        }
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(ReduceSignal::Ignored);
        };

        let mut contributed = false;
        if let Some(content) = candidate.content {
            for part in content.parts {
                if let GeminiPart::Text { text, thought } = part {
                    contributed |= if thought {
                        self.push_thoughts(&text)
                    } else {
                        self.push_answer(&text)
                    };
                }
            }
        }
        if let Some(grounding) = candidate.grounding_metadata {
            // Later chunks carry the most complete metadata; last one wins.
            // Metadata alone never opens the stream: a Created signal must
            // carry actual delta content.
            self.grounding = Some(grounding);
            contributed |= self.started;
        }
        Ok(self.signal(contributed))
    }

    fn push_answer(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        self.answer.push_str(text);
        true
    }

    fn push_thoughts(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        self.thoughts.push_str(text);
        true
    }

    fn capture_identity(&mut self, id: Option<&str>, model: Option<&str>) {
        if self.response_id.is_none() {
            self.response_id = id.map(String::from);
        }
        if self.model_id.is_none() {
            self.model_id = model.map(String::from);
        }
    }

    fn signal(&mut self, contributed: bool) -> ReduceSignal {
        if !contributed {
            return ReduceSignal::Ignored;
        }
        if self.started {
            ReduceSignal::Updated
        } else {
            self.started = true;
            ReduceSignal::Created
        }
    }

    fn model_error(error: &Value) -> ObservedError {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        AqueductError::UpstreamModel(detail).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_contributing_chunk_signals_created() {
        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        let signal = reducer
            .reduce(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)
            .unwrap();
        assert_eq!(signal, ReduceSignal::Ignored);

        let signal = reducer
            .reduce(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(signal, ReduceSignal::Created);

        let signal = reducer
            .reduce(r#"{"choices":[{"delta":{"content":"lo"}}]}"#)
            .unwrap();
        assert_eq!(signal, ReduceSignal::Updated);
        assert_eq!(reducer.answer(), "Hello");
    }

    #[test]
    fn reasoning_accumulates_separately_from_answer() {
        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        reducer
            .reduce(r#"{"choices":[{"delta":{"reasoning_content":"hmm "}}]}"#)
            .unwrap();
        reducer
            .reduce(r#"{"choices":[{"delta":{"content":"42"}}]}"#)
            .unwrap();
        assert_eq!(reducer.thoughts(), "hmm ");
        assert_eq!(reducer.answer(), "42");
    }

    #[test]
    fn gemini_thought_parts_feed_thoughts() {
        let mut reducer = ResponseReducer::new(ProviderKind::Gemini);
        let payload = r#"{"candidates":[{"content":{"parts":[
            {"text":"pondering","thought":true},
            {"text":"answer"}
        ]}}]}"#;
        reducer.reduce(payload).unwrap();
        assert_eq!(reducer.thoughts(), "pondering");
        assert_eq!(reducer.answer(), "answer");
    }

    #[test]
    fn grounding_metadata_last_write_wins() {
        let mut reducer = ResponseReducer::new(ProviderKind::Gemini);
        reducer
            .reduce(r#"{"candidates":[{"groundingMetadata":{"webSearchQueries":["a"]}}]}"#)
            .unwrap();
        reducer
            .reduce(r#"{"candidates":[{"groundingMetadata":{"webSearchQueries":["a","b"]}}]}"#)
            .unwrap();
        let queries = &reducer.grounding().unwrap()["webSearchQueries"];
        assert_eq!(queries.as_array().unwrap().len(), 2);
    }

    #[test]
    fn embedded_error_is_terminal() {
        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        let err = reducer
            .reduce(r#"{"error":{"message":"model overloaded"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("model overloaded"));

        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        let err = reducer
            .reduce(r#"{"choices":[{"delta":{},"error":{"message":"bad choice"}}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("bad choice"));
    }

    #[test]
    fn unparseable_chunk_is_counted_and_skipped() {
        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        let signal = reducer.reduce("not json at all").unwrap();
        assert_eq!(signal, ReduceSignal::Ignored);
        assert_eq!(reducer.parse_failures(), 1);
    }

    #[test]
    fn grounding_only_chunk_never_opens_the_stream() {
        let mut reducer = ResponseReducer::new(ProviderKind::Gemini);
        let signal = reducer
            .reduce(r#"{"candidates":[{"groundingMetadata":{"webSearchQueries":["q"]}}]}"#)
            .unwrap();
        // Metadata is retained, but no Created fires without content.
        assert_eq!(signal, ReduceSignal::Ignored);
        assert!(reducer.grounding().is_some());

        let signal = reducer
            .reduce(r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#)
            .unwrap();
        assert_eq!(signal, ReduceSignal::Created);

        // Once the stream is open, metadata alone is a real update.
        let signal = reducer
            .reduce(r#"{"candidates":[{"groundingMetadata":{"webSearchQueries":["q","r"]}}]}"#)
            .unwrap();
        assert_eq!(signal, ReduceSignal::Updated);
    }

    #[test]
    fn full_body_choice_error_is_terminal() {
        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        let body = r#"{"choices":[{"error":{"message":"model blew up"}}]}"#;
        let err = reducer.reduce_full(body).unwrap_err();
        assert!(err.to_string().contains("model blew up"));
    }

    #[test]
    fn full_body_reduces_without_streaming() {
        let mut reducer = ResponseReducer::new(ProviderKind::OpenAiCompat);
        let body = r#"{"id":"resp-1","model":"gpt-4o-2024",
            "choices":[{"message":{"content":"done","reasoning_content":"thought"}}]}"#;
        let signal = reducer.reduce_full(body).unwrap();
        assert_eq!(signal, ReduceSignal::Created);
        assert_eq!(reducer.answer(), "done");
        assert_eq!(reducer.thoughts(), "thought");
        assert_eq!(reducer.response_id(), Some("resp-1"));
        assert_eq!(reducer.model_id(), Some("gpt-4o-2024"));
    }
}
