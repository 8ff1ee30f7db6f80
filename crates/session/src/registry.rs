//! Codec registry: selects a plugin implementation for a session.

use tracing::{debug, info};

use vcs_codecs::{animation_info, AnimationDecoder, AnimationEncoder};
use vcs_common::{CodecInfo, CodecSelector, CodingError, CodingResult, DecoderPlugin, EncoderPlugin};

/// Builds a fresh encoder instance for each session.
pub type EncoderFactory = Box<dyn Fn() -> Box<dyn EncoderPlugin> + Send + Sync>;

/// Builds a fresh decoder instance for each session.
pub type DecoderFactory = Box<dyn Fn() -> Box<dyn DecoderPlugin> + Send + Sync>;

struct Registered<F> {
    info: CodecInfo,
    factory: F,
}

/// Available encoder and decoder implementations.
pub struct CodecRegistry {
    encoders: Vec<Registered<EncoderFactory>>,
    decoders: Vec<Registered<DecoderFactory>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            encoders: Vec::new(),
            decoders: Vec::new(),
        }
    }

    /// Create a registry with the built-in software codecs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_encoder(animation_info(), || Box::new(AnimationEncoder::new()));
        registry.register_decoder(animation_info(), || Box::new(AnimationDecoder::new()));
        info!(
            encoders = registry.encoders.len(),
            decoders = registry.decoders.len(),
            "Registered built-in codecs"
        );
        registry
    }

    /// Register an encoder. Replaces any encoder with the same id.
    pub fn register_encoder<F>(&mut self, info: CodecInfo, factory: F)
    where
        F: Fn() -> Box<dyn EncoderPlugin> + Send + Sync + 'static,
    {
        self.encoders.retain(|e| e.info.id != info.id);
        debug!(codec = %info.id, "Encoder registered");
        self.encoders.push(Registered {
            info,
            factory: Box::new(factory),
        });
    }

    /// Register a decoder. Replaces any decoder with the same id.
    pub fn register_decoder<F>(&mut self, info: CodecInfo, factory: F)
    where
        F: Fn() -> Box<dyn DecoderPlugin> + Send + Sync + 'static,
    {
        self.decoders.retain(|d| d.info.id != info.id);
        debug!(codec = %info.id, "Decoder registered");
        self.decoders.push(Registered {
            info,
            factory: Box::new(factory),
        });
    }

    /// Registered encoders, sorted by id.
    pub fn encoders(&self) -> Vec<&CodecInfo> {
        sorted_infos(&self.encoders)
    }

    /// Registered decoders, sorted by id.
    pub fn decoders(&self) -> Vec<&CodecInfo> {
        sorted_infos(&self.decoders)
    }

    /// Instantiate the best encoder matching `selector`.
    pub fn create_encoder(
        &self,
        selector: &CodecSelector,
    ) -> CodingResult<(CodecInfo, Box<dyn EncoderPlugin>)> {
        let entry = best_match(&self.encoders, selector)?;
        Ok((entry.info.clone(), (entry.factory)()))
    }

    /// Instantiate the best decoder matching `selector`.
    pub fn create_decoder(
        &self,
        selector: &CodecSelector,
    ) -> CodingResult<(CodecInfo, Box<dyn DecoderPlugin>)> {
        let entry = best_match(&self.decoders, selector)?;
        Ok((entry.info.clone(), (entry.factory)()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("encoders", &self.encoders())
            .field("decoders", &self.decoders())
            .finish()
    }
}

fn sorted_infos<F>(entries: &[Registered<F>]) -> Vec<&CodecInfo> {
    let mut infos: Vec<_> = entries.iter().map(|e| &e.info).collect();
    infos.sort_by(|a, b| a.id.cmp(&b.id));
    infos
}

/// First registered match, hardware implementations preferred.
fn best_match<'a, F>(
    entries: &'a [Registered<F>],
    selector: &CodecSelector,
) -> CodingResult<&'a Registered<F>> {
    let mut candidates = entries.iter().filter(|e| selector.matches(&e.info));
    let first = candidates
        .next()
        .ok_or_else(|| CodingError::CodecNotFound(selector.to_string()))?;
    Ok(std::iter::once(first)
        .chain(candidates)
        .find(|e| e.info.hardware_accelerated)
        .unwrap_or(first))
}
