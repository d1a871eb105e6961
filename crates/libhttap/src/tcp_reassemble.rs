// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Multi-flow TCP stream reassembly.
//!
//! The flow table is owned by a single loop; all mutation happens there, so
//! no locking is needed. Consumers receive reassembled bytes over per-flow
//! channels whose sending half lives in the flow state; dropping the state
//! signals end-of-stream.

use std::{
    collections::{BTreeMap, HashMap},
    num::Wrapping,
    time::Instant,
};

use tokio::sync::mpsc;

use crate::chomp::FlowKey;

type SeqNum = Wrapping<u32>;

/// Sequence numbers this far apart are treated as wrapped, not behind.
const HALF_RANGE: u32 = u32::MAX / 2;

/// Out-of-order bytes buffered per flow before the gap blocking them is
/// declared lost and abandoned.
const PENDING_LIMIT: usize = 1 << 20;

/// A decoded TCP segment with an owned payload.
#[derive(Clone, Debug)]
pub struct Segment {
    pub key: FlowKey,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Receiving half of a flow's reassembled byte stream. Closed when the flow
/// ends or is evicted.
pub type ByteReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Receives the read end of each newly observed flow.
pub trait FlowHandler {
    fn on_new_flow(&mut self, key: FlowKey, rx: ByteReceiver);
}

impl<F: FnMut(FlowKey, ByteReceiver)> FlowHandler for F {
    fn on_new_flow(&mut self, key: FlowKey, rx: ByteReceiver) {
        self(key, rx)
    }
}

struct Flow {
    /// Next sequence number expected to be delivered.
    next_seq: SeqNum,
    /// Sequence number one past the last byte, once a FIN has been seen.
    fin_seq: Option<SeqNum>,
    /// Reorder buffer: segments at or ahead of `next_seq`, keyed by their
    /// starting sequence number.
    pending: BTreeMap<SeqNum, Vec<u8>>,
    pending_bytes: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    last_activity: Instant,
}

impl Flow {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, next_seq: SeqNum, now: Instant) -> Flow {
        Flow {
            next_seq,
            fin_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            tx,
            last_activity: now,
        }
    }

    fn insert(&mut self, seq: SeqNum, mut payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        let behind = (self.next_seq - seq).0;
        if behind < HALF_RANGE && behind > 0 {
            if (behind as usize) >= payload.len() {
                // Stale retransmission, already delivered.
                return;
            }
            // Partial overlap with delivered data; keep the new tail.
            payload.drain(..behind as usize);
            return self.insert(self.next_seq, payload);
        }
        let entry = self.pending.entry(seq).or_default();
        if payload.len() > entry.len() {
            self.pending_bytes += payload.len() - entry.len();
            *entry = payload;
        }
    }

    /// Delivers the contiguous prefix starting at `next_seq`, discarding
    /// buffered segments that delivery has overtaken.
    fn drain(&mut self) {
        loop {
            let mut stale = Vec::new();
            let mut covering = None;
            for (&seq, data) in &self.pending {
                let behind = (self.next_seq - seq).0;
                if behind >= HALF_RANGE {
                    continue;
                }
                if (behind as usize) < data.len() {
                    covering = Some(seq);
                    break;
                }
                stale.push(seq);
            }
            for seq in stale {
                let data = self.pending.remove(&seq).unwrap();
                self.pending_bytes -= data.len();
            }
            let Some(seq) = covering else { break };

            let data = self.pending.remove(&seq).unwrap();
            self.pending_bytes -= data.len();
            let skip = (self.next_seq - seq).0 as usize;
            let out = data[skip..].to_vec();
            self.next_seq += Wrapping(out.len() as u32);
            let _ = self.tx.send(out);
        }

        if self.pending_bytes > PENDING_LIMIT {
            self.abandon_gap();
        }
    }

    /// Gives up on the bytes blocking delivery and restarts at the earliest
    /// buffered segment. The consumer's parser chokes on the seam and
    /// resynchronizes; that is the deal.
    fn abandon_gap(&mut self) {
        let Some(seq) = self.lowest_pending() else { return };
        self.next_seq = seq;
        self.drain();
    }

    /// The pending sequence number nearest ahead of `next_seq`, in wrapping
    /// terms; `BTreeMap` order alone is wrong across the wrap point.
    fn lowest_pending(&self) -> Option<SeqNum> {
        self.pending.keys().copied().min_by_key(|&seq| (seq - self.next_seq).0)
    }

    /// Delivers everything still buffered, in order, gaps and all.
    fn flush_pending(&mut self) {
        while !self.pending.is_empty() {
            self.abandon_gap();
        }
    }

    fn finished(&self) -> bool {
        match self.fin_seq {
            Some(fin) => (self.next_seq - fin).0 < HALF_RANGE,
            None => false,
        }
    }
}

/// Per-flow reassembly state, keyed by the observed flow. Single-owner:
/// `ingest` and `flush_older_than` are only ever called from the assembler
/// loop.
pub struct FlowTable<H> {
    flows: HashMap<FlowKey, Flow>,
    handler: H,
}

impl<H: FlowHandler> FlowTable<H> {
    pub fn new(handler: H) -> FlowTable<H> {
        FlowTable {
            flows: HashMap::new(),
            handler,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Feeds one segment through reassembly, creating the flow on first
    /// sight and tearing it down on RST or a fully reassembled FIN.
    pub fn ingest(&mut self, seg: Segment, now: Instant) {
        if seg.rst {
            if self.flows.remove(&seg.key).is_some() {
                tracing::debug!("flow {:?} reset", seg.key);
            }
            return;
        }

        if !self.flows.contains_key(&seg.key) {
            // A SYN consumes one sequence number; picked up mid-stream, the
            // first seen byte is the starting point.
            let isn = Wrapping(seg.seq) + Wrapping(seg.syn as u32);
            let (tx, rx) = mpsc::unbounded_channel();
            self.handler.on_new_flow(seg.key, rx);
            self.flows.insert(seg.key, Flow::new(tx, isn, now));
            tracing::debug!("new flow {:?}", seg.key);
        }

        let flow = self.flows.get_mut(&seg.key).unwrap();
        flow.last_activity = now;

        let data_seq = Wrapping(seg.seq) + Wrapping(seg.syn as u32);
        if seg.fin {
            flow.fin_seq = Some(data_seq + Wrapping(seg.payload.len() as u32));
        }
        flow.insert(data_seq, seg.payload);
        flow.drain();

        if flow.finished() {
            tracing::debug!("flow {:?} closed", seg.key);
            self.flows.remove(&seg.key);
        }
    }

    /// Evicts flows idle since before `cutoff`: pending bytes are delivered
    /// as-is and the stream is closed.
    pub fn flush_older_than(&mut self, cutoff: Instant) {
        self.flows.retain(|key, flow| {
            if flow.last_activity >= cutoff {
                return true;
            }
            tracing::debug!("evicting idle flow {key:?}");
            flow.flush_pending();
            false
        });
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use proptest::prelude::*;

    use super::*;

    type Flows = Rc<RefCell<Vec<(FlowKey, ByteReceiver)>>>;

    fn table() -> (FlowTable<impl FlowHandler>, Flows) {
        let flows: Flows = Rc::new(RefCell::new(Vec::new()));
        let sink = flows.clone();
        let table = FlowTable::new(move |key: FlowKey, rx: ByteReceiver| {
            sink.borrow_mut().push((key, rx))
        });
        (table, flows)
    }

    fn key() -> FlowKey {
        FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 40000,
            dst_port: 80,
        }
    }

    fn seg(seq: u32, payload: &[u8]) -> Segment {
        Segment {
            key: key(),
            seq,
            syn: false,
            fin: false,
            rst: false,
            payload: payload.to_vec(),
        }
    }

    fn syn(seq: u32) -> Segment {
        Segment {
            syn: true,
            ..seg(seq, b"")
        }
    }

    fn fin(seq: u32) -> Segment {
        Segment {
            fin: true,
            ..seg(seq, b"")
        }
    }

    fn received(rx: &mut ByteReceiver) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn closed(rx: &mut ByteReceiver) -> bool {
        loop {
            match rx.try_recv() {
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
            }
        }
    }

    #[test]
    fn delivers_in_order_traffic() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.ingest(seg(1001, b"hello "), now);
        table.ingest(seg(1007, b"world"), now);

        let mut flows = flows.borrow_mut();
        assert_eq!(flows.len(), 1);
        assert_eq!(received(&mut flows[0].1), b"hello world");
    }

    #[test]
    fn reorders_out_of_order_segments() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.ingest(seg(1007, b"world"), now);
        let mut borrow = flows.borrow_mut();
        assert_eq!(received(&mut borrow[0].1), b"");
        drop(borrow);

        table.ingest(seg(1001, b"hello "), now);
        let mut borrow = flows.borrow_mut();
        assert_eq!(received(&mut borrow[0].1), b"hello world");
    }

    #[test]
    fn reassembles_across_sequence_wraparound() {
        let (mut table, flows) = table();
        let now = Instant::now();
        let isn = u32::MAX - 3;
        table.ingest(syn(isn), now);
        table.ingest(seg(isn.wrapping_add(7), b"world"), now);
        table.ingest(seg(isn.wrapping_add(1), b"hello "), now);

        let mut flows = flows.borrow_mut();
        assert_eq!(received(&mut flows[0].1), b"hello world");
    }

    #[test]
    fn drops_stale_retransmissions() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.ingest(seg(1001, b"hello"), now);
        table.ingest(seg(1001, b"hello"), now);

        let mut flows = flows.borrow_mut();
        assert_eq!(received(&mut flows[0].1), b"hello");
    }

    #[test]
    fn trims_partial_overlaps() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.ingest(seg(1001, b"hello"), now);
        table.ingest(seg(1004, b"lo world"), now);

        let mut flows = flows.borrow_mut();
        assert_eq!(received(&mut flows[0].1), b"hello world");
    }

    #[test]
    fn fin_closes_the_stream() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.ingest(seg(1001, b"bye"), now);
        table.ingest(fin(1004), now);

        assert!(table.is_empty());
        let mut flows = flows.borrow_mut();
        assert_eq!(received(&mut flows[0].1), b"bye");
        assert!(closed(&mut flows[0].1));
    }

    #[test]
    fn rst_closes_immediately() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.ingest(seg(1001, b"hi"), now);
        table.ingest(
            Segment {
                rst: true,
                ..seg(1003, b"")
            },
            now,
        );

        assert!(table.is_empty());
        let mut flows = flows.borrow_mut();
        assert!(closed(&mut flows[0].1));
    }

    #[test]
    fn abandons_irrecoverable_gaps() {
        let (mut table, flows) = table();
        let now = Instant::now();
        let big = vec![b'x'; PENDING_LIMIT + 1];
        table.ingest(syn(1000), now);
        // 5-byte gap at 1001..1006 never arrives.
        table.ingest(seg(1006, &big), now);

        let mut flows = flows.borrow_mut();
        assert_eq!(received(&mut flows[0].1), big);
    }

    #[test]
    fn evicts_idle_flows_and_flushes_pending() {
        let (mut table, flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        // Held in the reorder buffer behind a gap.
        table.ingest(seg(1003, b"late"), now);

        table.flush_older_than(now + std::time::Duration::from_secs(1));
        assert!(table.is_empty());

        let mut flows = flows.borrow_mut();
        assert_eq!(received(&mut flows[0].1), b"late");
        assert!(closed(&mut flows[0].1));
    }

    #[test]
    fn keeps_active_flows_on_flush() {
        let (mut table, _flows) = table();
        let now = Instant::now();
        table.ingest(syn(1000), now);
        table.flush_older_than(now - std::time::Duration::from_secs(1));
        assert_eq!(table.len(), 1);
    }

    proptest! {
        #[test]
        fn reassembles_any_arrival_order(
            cuts in proptest::collection::btree_set(1usize..199, 0..6),
            seed in any::<u64>(),
        ) {
            let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();

            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                chunks.push((start, data[start..cut].to_vec()));
                start = cut;
            }

            // Deterministic shuffle from the seed.
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                order.swap(i, (state % (i as u64 + 1)) as usize);
            }

            let (mut table, flows) = table();
            let now = Instant::now();
            let isn = u32::MAX - 50;
            table.ingest(syn(isn), now);
            for &i in &order {
                let (offset, ref payload) = chunks[i];
                table.ingest(seg(isn.wrapping_add(1 + offset as u32), payload), now);
            }

            let mut flows = flows.borrow_mut();
            prop_assert_eq!(received(&mut flows[0].1), data);
        }
    }
}
