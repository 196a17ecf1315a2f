// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0138 zlib stream wrapper.
//!
//! Wraps an established byte channel so that everything written is
//! deflated and everything read is inflated. Each flush ends with a
//! zlib sync flush, so a stanza becomes visible to the peer as soon as
//! the session core flushes it; without that the compressor would sit
//! on partial blocks and the stream would deadlock.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const CHUNK: usize = 8 * 1024;

/// Stop accepting writes while this much compressed output is still
/// queued for the inner stream.
const TX_HIGH_WATER_MARK: usize = 64 * 1024;

/// A deflate/inflate duplex over any byte stream.
pub struct ZlibStream<S> {
    inner: S,
    decompress: Decompress,
    compress: Compress,
    /// Inflated bytes ready for the reader.
    rx_out: BytesMut,
    /// Deflated bytes not yet written to the inner stream.
    tx_out: BytesMut,
    /// A write happened since the last sync flush.
    needs_sync: bool,
}

impl<S> ZlibStream<S> {
    pub fn new(inner: S) -> ZlibStream<S> {
        ZlibStream {
            inner,
            decompress: Decompress::new(true),
            compress: Compress::new(Compression::default(), true),
            rx_out: BytesMut::new(),
            tx_out: BytesMut::new(),
            needs_sync: false,
        }
    }

    /// Run `input` through the compressor, appending everything it
    /// produces to `tx_out`.
    fn compress_into(&mut self, input: &[u8], flush: FlushCompress) -> io::Result<()> {
        let mut consumed = 0;
        loop {
            let mut out = [0u8; CHUNK];
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            self.compress
                .compress(&input[consumed..], &mut out, flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let used = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            consumed += used;
            self.tx_out.extend_from_slice(&out[..produced]);
            // Done once all input is in and the output buffer was not
            // filled to the brim (nothing left inside the compressor).
            if consumed == input.len() && produced < CHUNK {
                return Ok(());
            }
        }
    }

    /// Feed compressed bytes from the wire into the decompressor.
    fn decompress_into(&mut self, input: &[u8]) -> io::Result<()> {
        let mut consumed = 0;
        while consumed < input.len() {
            let mut out = [0u8; 2 * CHUNK];
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            self.decompress
                .decompress(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let used = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            consumed += used;
            self.rx_out.extend_from_slice(&out[..produced]);
            if used == 0 && produced == 0 {
                // The decompressor is stuck (e.g. stream end marker);
                // discard the rest to avoid spinning.
                return Ok(());
            }
        }
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ZlibStream<S> {
    /// Try to move queued compressed bytes into the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.tx_out.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.tx_out))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.tx_out.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ZlibStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.rx_out.is_empty() {
                let n = this.rx_out.len().min(buf.remaining());
                buf.put_slice(&this.rx_out.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let mut raw = [0u8; CHUNK];
            let mut raw_buf = ReadBuf::new(&mut raw);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw_buf))?;
            let filled = raw_buf.filled().len();
            if filled == 0 {
                // EOF on the wire.
                return Poll::Ready(Ok(()));
            }
            this.decompress_into(&raw[..filled])?;
            // Loop: a partial deflate block may produce nothing yet.
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ZlibStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => (),
            Poll::Pending => {
                if this.tx_out.len() >= TX_HIGH_WATER_MARK {
                    return Poll::Pending;
                }
            }
        }
        this.compress_into(buf, FlushCompress::None)?;
        this.needs_sync = true;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.needs_sync {
            this.compress_into(&[], FlushCompress::Sync)?;
            this.needs_sync = false;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.needs_sync {
            this.compress_into(&[], FlushCompress::Sync)?;
            this.needs_sync = false;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
