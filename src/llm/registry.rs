//! Name-indexed provider factory.
//!
//! Maps case-insensitive, trimmed provider names to factories producing
//! configured [`Interpreter`] instances. The default registry pre-registers
//! the five real providers.

use std::collections::BTreeMap;

use serde_json::Value;

use super::anthropic::AnthropicInterpreter;
use super::google::GoogleInterpreter;
use super::lmstudio::LmStudioInterpreter;
use super::ollama::OllamaInterpreter;
use super::openai::OpenAiInterpreter;
use super::Interpreter;
use crate::error::{RenderifyError, Result};
use crate::http::SharedTransport;

type FactoryFn = Box<dyn Fn(&Value) -> Box<dyn Interpreter> + Send + Sync>;

/// A named interpreter factory.
pub struct ProviderFactory {
    pub name: String,
    create: FactoryFn,
}

impl ProviderFactory {
    pub fn new(
        name: impl Into<String>,
        create: impl Fn(&Value) -> Box<dyn Interpreter> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            create: Box::new(create),
        }
    }
}

/// Registry of provider factories, keyed by normalized name.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a factory.
    pub fn register(&mut self, factory: ProviderFactory) {
        self.factories.insert(normalize(&factory.name), factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Whether `name` resolves to a factory.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize(name))
    }

    /// Create a configured interpreter for `name`.
    pub fn create(&self, name: &str, options: &Value) -> Result<Box<dyn Interpreter>> {
        let factory = self.factories.get(&normalize(name)).ok_or_else(|| {
            RenderifyError::Other(format!(
                "Unknown LLM provider: {name}. Available providers: {}",
                self.names().join(", ")
            ))
        })?;
        Ok((factory.create)(options))
    }
}

/// Registry with the five built-in providers registered.
pub fn default_registry(transport: SharedTransport) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    let t = transport.clone();
    registry.register(ProviderFactory::new("openai", move |options| {
        let mut client = OpenAiInterpreter::new(t.clone());
        client.configure(options);
        Box::new(client)
    }));

    let t = transport.clone();
    registry.register(ProviderFactory::new("anthropic", move |options| {
        let mut client = AnthropicInterpreter::new(t.clone());
        client.configure(options);
        Box::new(client)
    }));

    let t = transport.clone();
    registry.register(ProviderFactory::new("google", move |options| {
        let mut client = GoogleInterpreter::new(t.clone());
        client.configure(options);
        Box::new(client)
    }));

    let t = transport.clone();
    registry.register(ProviderFactory::new("ollama", move |options| {
        let mut client = OllamaInterpreter::new(t.clone());
        client.configure(options);
        Box::new(client)
    }));

    let t = transport;
    registry.register(ProviderFactory::new("lmstudio", move |options| {
        let mut client = LmStudioInterpreter::new(t.clone());
        client.configure(options);
        Box::new(client)
    }));

    registry
}
