//! Per-session service handles.
//!
//! Sessions receive every external dependency explicitly: the speech
//! adapters are injected by the embedding application (their wire shims
//! live outside the core), the LLM resolves through the static factory,
//! and retrieval is assembled from the agent's RAG settings.

use std::sync::Arc;

use voice_broker_core::{AgentProfile, LanguageModel, SpeechToText, TextToSpeech};
use voice_broker_llm::create_language_model;
use voice_broker_rag::{Embedder, Retriever, RetrieverConfig, VectorIndex};
use voice_broker_tools::SessionToolExecutor;

use crate::SessionError;

/// The full set of collaborators one session talks to.
pub struct Services {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub retriever: Option<Arc<Retriever>>,
    pub tools: Arc<SessionToolExecutor>,
}

impl Services {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        retriever: Option<Arc<Retriever>>,
        tools: Arc<SessionToolExecutor>,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            retriever,
            tools,
        }
    }

    /// Assemble services from an agent profile. Speech adapters are
    /// injected; the retriever is built when the agent carries RAG
    /// settings and the caller supplies an embedder and index.
    pub fn for_agent(
        agent: &AgentProfile,
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        embedder: Option<Arc<dyn Embedder>>,
        index: Option<Arc<dyn VectorIndex>>,
    ) -> Result<Self, SessionError> {
        let llm = create_language_model(&agent.llm)?;
        let tools = Arc::new(SessionToolExecutor::for_agent(agent));

        let retriever = match (&agent.rag, embedder, index) {
            (Some(rag), Some(embedder), Some(index)) => {
                let config = RetrieverConfig {
                    collection: rag.collection_name.clone(),
                    top_k: rag.top_k,
                    namespace: rag.namespace.clone(),
                };
                Some(Arc::new(Retriever::new(embedder, index, config)))
            }
            _ => None,
        };

        Ok(Self::new(stt, llm, tts, retriever, tools))
    }
}
