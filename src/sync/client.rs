//! Child side of the synchronous token service.

use std::io::{self, Read, Write};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use super::{
    decode_values, encode_request, read_full, Result, SyncError, SyncMessageId,
    SynchronousService, INVALID_HANDLE,
};
use crate::types::{PlatformHandle, Token};

/// Blocking request/response client over the child's sync pipe.
///
/// Callers are serialized by one lock held for the full round trip. The
/// client starts without a pipe; calls made before [`bootstrap`] block until
/// the pipe is installed. There is no timeout: an unresponsive parent blocks
/// the caller indefinitely.
///
/// [`bootstrap`]: SyncChannelClient::bootstrap
pub struct SyncChannelClient<S> {
    stream: Mutex<Option<S>>,
    ready: Condvar,
    max_handles: usize,
}

impl<S: Read + Write + Send> SyncChannelClient<S> {
    pub fn new(max_handles: usize) -> Self {
        Self {
            stream: Mutex::new(None),
            ready: Condvar::new(),
            max_handles,
        }
    }

    /// Install the sync pipe and read the async channel handle the parent
    /// sends as the first message on it.
    pub fn bootstrap(&self, mut stream: S) -> Result<PlatformHandle> {
        let mut raw = [0u8; 8];
        if !read_full(&mut stream, &mut raw)? {
            return Err(SyncError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "sync pipe closed before bootstrap handle",
            )));
        }
        let handle = PlatformHandle(u64::from_le_bytes(raw));

        *self.lock() = Some(stream);
        self.ready.notify_all();

        debug!(%handle, "Sync channel bootstrapped");
        Ok(handle)
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<S>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one request and read exactly `response_size` bytes back, holding
    /// the lock for the whole exchange.
    fn round_trip(&self, request: &[u8], response_size: usize) -> Result<Vec<u8>> {
        let mut guard = self.lock();
        while guard.is_none() {
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(SyncError::Malformed("sync pipe missing".to_string()));
        };

        let written = stream.write(request).map_err(|e| {
            error!(error = %e, "Couldn't write sync request");
            SyncError::Io(e)
        })?;
        if written != request.len() {
            error!(written, expected = request.len(), "Short write on sync channel");
            return Err(SyncError::ShortWrite {
                written,
                expected: request.len(),
            });
        }

        let mut response = vec![0u8; response_size];
        match read_full(stream, &mut response) {
            Ok(true) => Ok(response),
            Ok(false) => {
                error!("Sync pipe closed while awaiting response");
                Err(SyncError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "sync pipe closed",
                )))
            }
            Err(e) => {
                error!(error = %e, "Couldn't read sync response");
                Err(SyncError::Io(e))
            }
        }
    }

    fn check_batch(&self, count: usize) -> Result<()> {
        if count > self.max_handles {
            return Err(SyncError::TooManyHandles {
                count,
                max: self.max_handles,
            });
        }
        Ok(())
    }

    /// One round trip. A response word equal to [`INVALID_HANDLE`] (the
    /// reserved `u64::MAX`) in any slot fails the whole call with `Rejected`.
    fn request(&self, id: SyncMessageId, values: &[u64], response_count: usize) -> Result<Vec<u64>> {
        let request = encode_request(id, values);
        let response = self.round_trip(&request, response_count * 8)?;
        let values = decode_values(&response);
        if values.iter().any(|value| *value == INVALID_HANDLE.0) {
            return Err(SyncError::Rejected);
        }
        Ok(values)
    }
}

impl<S: Read + Write + Send> SynchronousService for SyncChannelClient<S> {
    fn handle_to_token(&self, handles: &[PlatformHandle]) -> Result<Vec<Token>> {
        self.check_batch(handles.len())?;
        if handles.contains(&INVALID_HANDLE) {
            return Err(SyncError::Rejected);
        }
        let raw: Vec<u64> = handles.iter().map(|h| h.0).collect();
        let tokens = self.request(SyncMessageId::HandleToToken, &raw, raw.len())?;
        Ok(tokens.into_iter().map(Token).collect())
    }

    fn token_to_handle(&self, tokens: &[Token]) -> Result<Vec<PlatformHandle>> {
        self.check_batch(tokens.len())?;
        let raw: Vec<u64> = tokens.iter().map(|t| t.0).collect();
        let handles = self.request(SyncMessageId::TokenToHandle, &raw, raw.len())?;
        Ok(handles.into_iter().map(PlatformHandle).collect())
    }

    fn create_channel_pair(&self) -> Result<(PlatformHandle, PlatformHandle)> {
        let handles = self.request(SyncMessageId::CreatePlatformChannelPair, &[], 2)?;
        Ok((PlatformHandle(handles[0]), PlatformHandle(handles[1])))
    }
}
