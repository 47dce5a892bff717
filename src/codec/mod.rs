//! Incremental per-response decoders
//!
//! A decoder consumes body lines from a multi-line NNTP response and
//! produces decoded values: binary payloads ([`Content`]), header blocks,
//! overview records, or group lists. The connection keeps an ordered chain
//! of decoders per command; the first decoder whose `detect` claims a line
//! becomes active and consumes subsequent lines until it yields.

mod grouplist;
mod header;
mod uu;
mod xover;
mod yenc;

pub use grouplist::{GroupEntry, GroupListDecoder, PostingStatus, parse_group_line};
pub use header::HeaderDecoder;
pub use uu::{UU_BYTES_PER_LINE, UuDecoder, uu_encode};
pub use xover::{OverviewEntry, XoverDecoder, XoverSort, date_key, parse_overview_line};
pub use yenc::{YENC_LINE_WIDTH, YencDecoder, yenc_encode};

use crate::article::Header;
use crate::content::Content;

/// A value produced by a decoder
#[derive(Debug)]
pub enum Decoded {
    /// Decoded binary payload
    Payload(Content),
    /// Parsed header block
    Headers(Header),
    /// Parsed overview records
    Overview(Vec<OverviewEntry>),
    /// Parsed group list
    Groups(Vec<GroupEntry>),
}

/// Outcome of feeding one line to an active decoder
#[derive(Debug)]
pub enum DecodeStep {
    /// Finished; emit the produced value and deactivate
    Done(Decoded),
    /// More input needed; remain active
    Continue,
    /// Finished without a result; deactivate
    Skip,
    /// Unrecoverable framing failure; deactivate
    Failed,
}

/// An incremental line-fed decoder
pub trait Decoder: Send {
    /// Whether this line opens a region this decoder understands
    fn detect(&self, line: &[u8]) -> bool;

    /// Consume one body line
    fn feed(&mut self, line: &[u8]) -> DecodeStep;

    /// The response body ended while this decoder was active
    fn finalize(&mut self) -> DecodeStep;

    /// Forget all state so the decoder can be consulted again
    fn reset(&mut self);
}

/// What the chain did with a line
#[derive(Debug)]
pub enum ChainOutput {
    /// An active decoder completed and produced a value
    Produced(Decoded),
    /// The line was consumed by a decoder
    Consumed,
    /// No decoder claimed the line
    Unclaimed,
}

/// An ordered set of decoders sharing one response body
pub struct DecoderChain {
    decoders: Vec<Box<dyn Decoder>>,
    active: Option<usize>,
}

impl DecoderChain {
    /// Build a chain; order decides claim priority
    pub fn new(decoders: Vec<Box<dyn Decoder>>) -> Self {
        Self {
            decoders,
            active: None,
        }
    }

    /// An empty chain; every line goes to the response body
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn step(&mut self, index: usize, line: &[u8]) -> ChainOutput {
        match self.decoders[index].feed(line) {
            DecodeStep::Done(value) => {
                self.active = None;
                ChainOutput::Produced(value)
            }
            DecodeStep::Continue => {
                self.active = Some(index);
                ChainOutput::Consumed
            }
            DecodeStep::Skip | DecodeStep::Failed => {
                self.active = None;
                ChainOutput::Consumed
            }
        }
    }

    /// Offer one body line to the chain
    pub fn feed(&mut self, line: &[u8]) -> ChainOutput {
        if let Some(index) = self.active {
            return self.step(index, line);
        }
        for index in 0..self.decoders.len() {
            if self.decoders[index].detect(line) {
                return self.step(index, line);
            }
        }
        ChainOutput::Unclaimed
    }

    /// The body ended; flush whatever the active decoder holds
    pub fn finish(&mut self) -> Option<Decoded> {
        let index = self.active.take()?;
        match self.decoders[index].finalize() {
            DecodeStep::Done(value) => Some(value),
            _ => None,
        }
    }

    /// Reset every decoder for the next command
    pub fn reset(&mut self) {
        for decoder in &mut self.decoders {
            decoder.reset();
        }
        self.active = None;
    }
}
