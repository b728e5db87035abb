//! Parent side of the synchronous token service.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{
    decode_header, decode_values, encode_values, read_full, Result, SyncError, SyncMessageId,
    HEADER_SIZE, INVALID_HANDLE,
};
use crate::channel::{lock, ChannelFactory};
use crate::types::{PlatformHandle, Token};

/// Moves handles across the process boundary.
///
/// Implemented by the embedder on platforms with handle duplication; the
/// token server only decides what to duplicate.
pub trait HandleDuplicator: Send + Sync {
    /// Duplicate a handle out of the child into the parent.
    fn duplicate_from_child(&self, handle: PlatformHandle) -> Result<PlatformHandle>;

    /// Duplicate a parent-held handle into the child.
    fn duplicate_to_child(&self, handle: PlatformHandle) -> Result<PlatformHandle>;
}

/// Duplicator for processes that share one handle namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDuplicator;

impl HandleDuplicator for IdentityDuplicator {
    fn duplicate_from_child(&self, handle: PlatformHandle) -> Result<PlatformHandle> {
        Ok(handle)
    }

    fn duplicate_to_child(&self, handle: PlatformHandle) -> Result<PlatformHandle> {
        Ok(handle)
    }
}

/// Parent-wide table of issued tokens.
///
/// Shared by every child's token server so a token minted for one child can
/// be redeemed by another. Redeeming consumes the token.
#[derive(Clone, Default)]
pub struct TokenTable {
    inner: Arc<Mutex<TokenTableInner>>,
}

#[derive(Default)]
struct TokenTableInner {
    next: u64,
    handles: HashMap<Token, PlatformHandle>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, handle: PlatformHandle) -> Token {
        let mut inner = lock(&self.inner);
        inner.next += 1;
        let token = Token(inner.next);
        inner.handles.insert(token, handle);
        token
    }

    /// Redeem every token or none of them.
    pub fn redeem_all(&self, tokens: &[Token]) -> Option<Vec<PlatformHandle>> {
        let mut inner = lock(&self.inner);
        if !tokens.iter().all(|token| inner.handles.contains_key(token)) {
            return None;
        }
        tokens
            .iter()
            .map(|token| inner.handles.remove(token))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers one child's synchronous requests.
pub struct TokenServer {
    tokens: TokenTable,
    duplicator: Arc<dyn HandleDuplicator>,
    factory: Arc<dyn ChannelFactory>,
    max_handles: usize,
}

impl TokenServer {
    pub fn new(
        tokens: TokenTable,
        duplicator: Arc<dyn HandleDuplicator>,
        factory: Arc<dyn ChannelFactory>,
        max_handles: usize,
    ) -> Self {
        Self {
            tokens,
            duplicator,
            factory,
            max_handles,
        }
    }

    /// Send the child its async channel handle as the first sync message.
    pub fn bootstrap<S: Write>(stream: &mut S, async_handle: PlatformHandle) -> Result<()> {
        stream.write_all(&async_handle.0.to_le_bytes())?;
        stream.flush()?;
        Ok(())
    }

    /// Serve requests until the child closes the pipe.
    ///
    /// Protocol errors (unknown ids, malformed sizes) end the loop with an
    /// error; the pipe is unusable afterwards.
    pub fn serve<S: Read + Write>(&self, stream: &mut S) -> Result<()> {
        info!("Token server started");
        loop {
            let mut header = [0u8; HEADER_SIZE];
            if !read_full(stream, &mut header)? {
                info!("Sync pipe closed by child");
                return Ok(());
            }
            let (size, raw_id) = decode_header(&header);
            let id = SyncMessageId::try_from(raw_id)?;

            let size = size as usize;
            if size < HEADER_SIZE || (size - HEADER_SIZE) % 8 != 0 {
                return Err(SyncError::Malformed(format!("request size {}", size)));
            }
            let count = (size - HEADER_SIZE) / 8;
            if count > self.max_handles {
                return Err(SyncError::TooManyHandles {
                    count,
                    max: self.max_handles,
                });
            }

            let mut payload = vec![0u8; size - HEADER_SIZE];
            if !payload.is_empty() && !read_full(stream, &mut payload)? {
                return Err(SyncError::Malformed("payload missing".to_string()));
            }

            let response = self.handle_request(id, &decode_values(&payload));
            stream.write_all(&encode_values(&response))?;
            stream.flush()?;
        }
    }

    /// Produce the response slots for one request. Refusals fill every slot
    /// with `INVALID_HANDLE`.
    pub fn handle_request(&self, id: SyncMessageId, values: &[u64]) -> Vec<u64> {
        let outcome = match id {
            SyncMessageId::HandleToToken => self.handle_to_token(values),
            SyncMessageId::TokenToHandle => self.token_to_handle(values),
            SyncMessageId::CreatePlatformChannelPair => self.create_channel_pair(),
        };
        let slots = match id {
            SyncMessageId::CreatePlatformChannelPair => 2,
            _ => values.len(),
        };
        match outcome {
            Ok(values) => {
                debug!(request = ?id, count = values.len(), "Sync request served");
                values
            }
            Err(e) => {
                warn!(request = ?id, error = %e, "Sync request refused");
                vec![INVALID_HANDLE.0; slots]
            }
        }
    }

    fn handle_to_token(&self, handles: &[u64]) -> Result<Vec<u64>> {
        let mut duplicated = Vec::with_capacity(handles.len());
        for handle in handles {
            let handle = self.duplicator.duplicate_from_child(PlatformHandle(*handle))?;
            if handle == INVALID_HANDLE {
                return Err(SyncError::Rejected);
            }
            duplicated.push(handle);
        }
        Ok(duplicated
            .into_iter()
            .map(|handle| self.tokens.issue(handle).0)
            .collect())
    }

    fn token_to_handle(&self, tokens: &[u64]) -> Result<Vec<u64>> {
        let tokens: Vec<Token> = tokens.iter().copied().map(Token).collect();
        let handles = self.tokens.redeem_all(&tokens).ok_or(SyncError::Rejected)?;
        handles
            .into_iter()
            .map(|handle| match self.duplicator.duplicate_to_child(handle)? {
                INVALID_HANDLE => Err(SyncError::Rejected),
                handle => Ok(handle.0),
            })
            .collect()
    }

    fn create_channel_pair(&self) -> Result<Vec<u64>> {
        let (server, client) = self.factory.create_pair()?;
        let server = self.duplicator.duplicate_to_child(server)?;
        let client = self.duplicator.duplicate_to_child(client)?;
        Ok(vec![server.0, client.0])
    }
}
