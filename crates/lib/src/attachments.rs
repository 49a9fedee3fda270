//! Lazy attachment resolution for one inbound message.
//!
//! Positions resolve strictly front to back and at most once each; the result (or the
//! `Unresolved` sentinel on failure) is cached for every later reader.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Reference to an attachment as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Transport-specific attachment id (e.g. Telegram file_id).
    pub source_id: String,
    /// Lower quality URL used when the lookup yields nothing.
    pub preview_url: Option<String>,
}

impl AttachmentRef {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            preview_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAttachment {
    Url(String),
    /// Lookup failed and no preview was available.
    Unresolved,
}

impl ResolvedAttachment {
    pub fn url(&self) -> Option<&str> {
        match self {
            ResolvedAttachment::Url(url) => Some(url),
            ResolvedAttachment::Unresolved => None,
        }
    }
}

/// Turns an attachment reference into a downloadable URL (typically a network call).
#[async_trait]
pub trait AttachmentLookup: Send + Sync {
    async fn resolve(&self, attachment: &AttachmentRef) -> anyhow::Result<Option<String>>;
}

pub struct AttachmentResolver {
    refs: Vec<AttachmentRef>,
    cache: Vec<OnceCell<ResolvedAttachment>>,
    lookup: Option<Arc<dyn AttachmentLookup>>,
}

impl AttachmentResolver {
    pub fn new(refs: Vec<AttachmentRef>, lookup: Arc<dyn AttachmentLookup>) -> Self {
        let cache = refs.iter().map(|_| OnceCell::new()).collect();
        Self {
            refs,
            cache,
            lookup: Some(lookup),
        }
    }

    /// Resolver without a lookup: every position falls back to its preview URL.
    pub fn without_lookup(refs: Vec<AttachmentRef>) -> Self {
        let cache = refs.iter().map(|_| OnceCell::new()).collect();
        Self {
            refs,
            cache,
            lookup: None,
        }
    }

    pub fn empty() -> Self {
        Self::without_lookup(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn refs(&self) -> &[AttachmentRef] {
        &self.refs
    }

    /// Resolved value at `index`, resolving every earlier position first. None past the end.
    pub async fn get(&self, index: usize) -> Option<ResolvedAttachment> {
        if index >= self.refs.len() {
            return None;
        }
        for position in 0..index {
            self.resolve_at(position).await;
        }
        self.resolve_at(index).await
    }

    /// Forward cursor starting at position 0.
    pub fn cursor(&self) -> AttachmentCursor<'_> {
        AttachmentCursor {
            resolver: self,
            position: 0,
        }
    }

    /// Resolve every position in order.
    pub async fn resolve_all(&self) -> Vec<ResolvedAttachment> {
        let mut out = Vec::with_capacity(self.refs.len());
        let mut cursor = self.cursor();
        while let Some(resolved) = cursor.next().await {
            out.push(resolved);
        }
        out
    }

    async fn resolve_at(&self, position: usize) -> Option<ResolvedAttachment> {
        let attachment = self.refs.get(position)?;
        let cell = self.cache.get(position)?;
        let resolved = cell
            .get_or_init(|| async {
                let looked_up = match &self.lookup {
                    Some(lookup) => match lookup.resolve(attachment).await {
                        Ok(url) => url,
                        Err(e) => {
                            log::debug!(
                                "attachments: lookup for {} failed: {:#}",
                                attachment.source_id,
                                e
                            );
                            None
                        }
                    },
                    None => None,
                };
                match looked_up.or_else(|| attachment.preview_url.clone()) {
                    Some(url) => ResolvedAttachment::Url(url),
                    None => ResolvedAttachment::Unresolved,
                }
            })
            .await;
        Some(resolved.clone())
    }
}

impl fmt::Debug for AttachmentResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self.cache.iter().filter(|c| c.initialized()).count();
        f.debug_struct("AttachmentResolver")
            .field("refs", &self.refs)
            .field("resolved", &resolved)
            .finish()
    }
}

/// Forward-only view over a resolver. Not restartable; create a new cursor to read again
/// (already resolved positions come from the cache).
pub struct AttachmentCursor<'a> {
    resolver: &'a AttachmentResolver,
    position: usize,
}

impl AttachmentCursor<'_> {
    pub async fn next(&mut self) -> Option<ResolvedAttachment> {
        let resolved = self.resolver.get(self.position).await?;
        self.position += 1;
        Some(resolved)
    }

    pub fn position(&self) -> usize {
        self.position
    }
}
