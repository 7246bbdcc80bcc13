//! Shared test harness: a scripted in-memory transport, manual timers, and
//! recording sinks/producers for driving the selection engine without an X
//! server.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use prism::{
    Atom, DataProducer, FinishDisposition, PropertyChunk, PropertyEdit, PropertyProbe, Pull,
    ReadSink, SelectionAtoms, SelectionConfig, SelectionEngine, SelectionError, SelectionEvent,
    SelectionSource, Timestamp, TimerHost, TimerToken, TransferOutcome, Transport, Window,
};

pub const XFER_WIN: Window = 1;
pub const REQUESTOR: Window = 0x77;
pub const OTHER_REQUESTOR: Window = 0x78;

pub const CLIPBOARD: Atom = 50;
pub const UTF8: Atom = 60;
pub const PNG: Atom = 61;
pub const DEST: Atom = 70;
pub const DEST2: Atom = 71;
pub const BATCH_PROP: Atom = 72;

pub const INCR: Atom = 100;
pub const TARGETS: Atom = 101;
pub const TIMESTAMP: Atom = 102;
pub const MULTIPLE: Atom = 103;
pub const ATOM_PAIR: Atom = 104;

/// First minted slot property; slot `n` maps to `SLOT_BASE + n`.
pub const SLOT_BASE: Atom = 900;

pub fn atoms() -> SelectionAtoms {
    SelectionAtoms {
        incr: INCR,
        targets: TARGETS,
        timestamp: TIMESTAMP,
        multiple: MULTIPLE,
        atom_pair: ATOM_PAIR,
    }
}

/// Everything the engine put on the wire, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    SetOwner {
        selection: Atom,
        owner: Option<Window>,
        time: Timestamp,
    },
    Convert {
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    },
    Write {
        window: Window,
        property: Atom,
        ty: Atom,
        data: Vec<u8>,
    },
    WriteWords {
        window: Window,
        property: Atom,
        ty: Atom,
        words: Vec<u32>,
    },
    Delete {
        window: Window,
        property: Atom,
    },
    Notify {
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Option<Atom>,
    },
    Watch {
        window: Window,
        enable: bool,
    },
}

#[derive(Debug, Clone)]
pub enum PropValue {
    Bytes { ty: Atom, data: Vec<u8> },
    Words { ty: Atom, words: Vec<u32> },
}

impl PropValue {
    fn ty(&self) -> Atom {
        match self {
            PropValue::Bytes { ty, .. } | PropValue::Words { ty, .. } => *ty,
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            PropValue::Bytes { data, .. } => data.len(),
            PropValue::Words { words, .. } => words.len() * 4,
        }
    }
}

/// In-memory stand-in for the X wire: properties live in a map, every
/// engine-issued operation is recorded.
pub struct MockTransport {
    pub quantum: usize,
    pub props: HashMap<(Window, Atom), PropValue>,
    pub ops: Vec<WireOp>,
    /// Scripted failure: the next bounded read errors out.
    pub fail_reads: bool,
}

impl MockTransport {
    pub fn new(quantum: usize) -> Self {
        Self {
            quantum,
            props: HashMap::new(),
            ops: Vec::new(),
            fail_reads: false,
        }
    }

    pub fn notify_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, WireOp::Notify { .. }))
            .count()
    }

    pub fn last_notify(&self) -> Option<(Window, Atom, Atom, Option<Atom>)> {
        self.ops.iter().rev().find_map(|op| match op {
            WireOp::Notify {
                requestor,
                selection,
                target,
                property,
            } => Some((*requestor, *selection, *target, *property)),
            _ => None,
        })
    }

    /// All byte-writes the engine issued to one destination, in order.
    pub fn writes_to(&self, window: Window, property: Atom) -> Vec<Vec<u8>> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                WireOp::Write {
                    window: w,
                    property: p,
                    data,
                    ..
                } if *w == window && *p == property => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn transfer_window(&self) -> Window {
        XFER_WIN
    }

    fn max_transfer_bytes(&self) -> usize {
        self.quantum
    }

    fn intern_slot_property(&mut self, index: u64) -> Result<Atom, SelectionError> {
        Ok(SLOT_BASE + index as Atom)
    }

    fn set_selection_owner(
        &mut self,
        selection: Atom,
        owner: Option<Window>,
        time: Timestamp,
    ) -> Result<(), SelectionError> {
        self.ops.push(WireOp::SetOwner {
            selection,
            owner,
            time,
        });
        Ok(())
    }

    fn convert_selection(
        &mut self,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), SelectionError> {
        self.ops.push(WireOp::Convert {
            selection,
            target,
            property,
            time,
        });
        Ok(())
    }

    fn probe_property(
        &mut self,
        window: Window,
        property: Atom,
    ) -> Result<PropertyProbe, SelectionError> {
        Ok(match self.props.get(&(window, property)) {
            None => PropertyProbe {
                ty: 0,
                format: 0,
                bytes_total: 0,
            },
            Some(value) => PropertyProbe {
                ty: value.ty(),
                format: match value {
                    PropValue::Bytes { .. } => 8,
                    PropValue::Words { .. } => 32,
                },
                bytes_total: value.byte_len(),
            },
        })
    }

    fn read_property(
        &mut self,
        window: Window,
        property: Atom,
        byte_offset: usize,
        max_bytes: usize,
        delete: bool,
    ) -> Result<PropertyChunk, SelectionError> {
        if self.fail_reads {
            return Err(SelectionError::Transport("scripted read failure".into()));
        }
        let Some(value) = self.props.get(&(window, property)) else {
            return Ok(PropertyChunk {
                ty: 0,
                data: Vec::new(),
                remaining: 0,
            });
        };
        let PropValue::Bytes { ty, data } = value else {
            return Err(SelectionError::Malformed("not a byte property".into()));
        };
        let ty = *ty;
        let start = byte_offset.min(data.len());
        let end = (start + max_bytes).min(data.len());
        let slice = data[start..end].to_vec();
        let remaining = data.len() - end;
        if delete && remaining == 0 {
            self.props.remove(&(window, property));
        }
        Ok(PropertyChunk {
            ty,
            data: slice,
            remaining,
        })
    }

    fn read_property_words(
        &mut self,
        window: Window,
        property: Atom,
    ) -> Result<Vec<u32>, SelectionError> {
        match self.props.get(&(window, property)) {
            Some(PropValue::Words { words, .. }) => Ok(words.clone()),
            Some(PropValue::Bytes { .. }) => {
                Err(SelectionError::Malformed("not a format-32 property".into()))
            }
            None => Err(SelectionError::Malformed("no such property".into())),
        }
    }

    fn write_property(
        &mut self,
        window: Window,
        property: Atom,
        ty: Atom,
        data: &[u8],
    ) -> Result<(), SelectionError> {
        self.props.insert(
            (window, property),
            PropValue::Bytes {
                ty,
                data: data.to_vec(),
            },
        );
        self.ops.push(WireOp::Write {
            window,
            property,
            ty,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn write_property_words(
        &mut self,
        window: Window,
        property: Atom,
        ty: Atom,
        words: &[u32],
    ) -> Result<(), SelectionError> {
        self.props.insert(
            (window, property),
            PropValue::Words {
                ty,
                words: words.to_vec(),
            },
        );
        self.ops.push(WireOp::WriteWords {
            window,
            property,
            ty,
            words: words.to_vec(),
        });
        Ok(())
    }

    fn delete_property(&mut self, window: Window, property: Atom) -> Result<(), SelectionError> {
        self.props.remove(&(window, property));
        self.ops.push(WireOp::Delete { window, property });
        Ok(())
    }

    fn send_notify(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Option<Atom>,
        _time: Timestamp,
    ) -> Result<(), SelectionError> {
        self.ops.push(WireOp::Notify {
            requestor,
            selection,
            target,
            property,
        });
        Ok(())
    }

    fn watch_window(&mut self, window: Window, enable: bool) -> Result<(), SelectionError> {
        self.ops.push(WireOp::Watch { window, enable });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SelectionError> {
        Ok(())
    }
}

/// Manual timer wheel: nothing fires until the test fires it.
#[derive(Default)]
pub struct MockTimers {
    pub active: Vec<(TimerToken, u64)>,
    pub cancelled: Vec<TimerToken>,
}

impl TimerHost for MockTimers {
    fn add_timer(&mut self, delay_ms: u64, token: TimerToken) {
        self.active.push((token, delay_ms));
    }

    fn remove_timer(&mut self, token: TimerToken) {
        self.active.retain(|(t, _)| *t != token);
        self.cancelled.push(token);
    }
}

pub type TestEngine = SelectionEngine<MockTransport, MockTimers>;

pub fn new_engine(quantum: usize) -> TestEngine {
    new_engine_with(quantum, SelectionConfig::default())
}

pub fn new_engine_with(quantum: usize, config: SelectionConfig) -> TestEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    SelectionEngine::new(MockTransport::new(quantum), MockTimers::default(), atoms(), config)
}

/// Fires the most recently armed timer still active.
pub fn fire_active_timer(engine: &mut TestEngine) {
    let token = engine
        .timers()
        .active
        .last()
        .map(|(token, _)| *token)
        .expect("no armed timer to fire");
    engine.timer_fired(token);
}

// Event builders.

pub fn convert_requested(
    requestor: Window,
    selection: Atom,
    target: Atom,
    property: Atom,
    time: Timestamp,
) -> SelectionEvent {
    SelectionEvent::ConvertRequested {
        requestor,
        selection,
        target,
        property,
        time,
    }
}

pub fn conversion_done(selection: Atom, target: Atom, property: Atom) -> SelectionEvent {
    SelectionEvent::ConversionDone {
        selection,
        target,
        property,
        time: 0,
    }
}

pub fn property_new_value(window: Window, property: Atom) -> SelectionEvent {
    SelectionEvent::PropertyChanged {
        window,
        property,
        edit: PropertyEdit::NewValue,
        time: 0,
    }
}

pub fn property_deleted(window: Window, property: Atom) -> SelectionEvent {
    SelectionEvent::PropertyChanged {
        window,
        property,
        edit: PropertyEdit::Deleted,
        time: 0,
    }
}

/// Simulates the requestor consuming (reading and deleting) a property.
pub fn consume_property(engine: &mut TestEngine, window: Window, property: Atom) {
    engine.transport_mut().props.remove(&(window, property));
    engine.handle_event(property_deleted(window, property));
}

// Read-side doubles.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Start(Atom),
    Chunk(usize),
    Finish(bool),
}

pub struct RecordingSink {
    pub events: Rc<RefCell<Vec<SinkEvent>>>,
    pub defer: bool,
}

impl ReadSink for RecordingSink {
    fn on_start(&mut self, ty: Atom) {
        self.events.borrow_mut().push(SinkEvent::Start(ty));
    }

    fn on_chunk(&mut self, pending: usize) {
        self.events.borrow_mut().push(SinkEvent::Chunk(pending));
    }

    fn on_finish(&mut self, success: bool) -> FinishDisposition {
        self.events.borrow_mut().push(SinkEvent::Finish(success));
        if self.defer {
            FinishDisposition::Defer
        } else {
            FinishDisposition::Free
        }
    }
}

pub fn recording_sink() -> (Box<dyn ReadSink>, Rc<RefCell<Vec<SinkEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    (
        Box::new(RecordingSink {
            events: events.clone(),
            defer: false,
        }),
        events,
    )
}

pub fn deferring_sink() -> (Box<dyn ReadSink>, Rc<RefCell<Vec<SinkEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    (
        Box::new(RecordingSink {
            events: events.clone(),
            defer: true,
        }),
        events,
    )
}

pub fn finish_count(events: &Rc<RefCell<Vec<SinkEvent>>>) -> usize {
    events
        .borrow()
        .iter()
        .filter(|event| matches!(event, SinkEvent::Finish(_)))
        .count()
}

// Write-side doubles.

pub type Outcomes = Rc<RefCell<Vec<TransferOutcome>>>;

pub fn outcomes() -> Outcomes {
    Rc::new(RefCell::new(Vec::new()))
}

/// Streams a fixed byte vector, filling as much of the buffer as allowed
/// per pull.
pub struct VecProducer {
    data: Vec<u8>,
    pos: usize,
    outcomes: Outcomes,
}

impl VecProducer {
    pub fn new(data: Vec<u8>, outcomes: Outcomes) -> Self {
        Self {
            data,
            pos: 0,
            outcomes,
        }
    }
}

impl DataProducer for VecProducer {
    fn pull(&mut self, buf: &mut [u8]) -> Result<Pull, SelectionError> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        if self.pos == self.data.len() {
            Ok(Pull::Eof(n))
        } else {
            Ok(Pull::Data(n))
        }
    }

    fn close(&mut self, outcome: TransferOutcome) {
        self.outcomes.borrow_mut().push(outcome);
    }
}

/// Replays a fixed pull script; an exhausted script blocks.
pub enum Step {
    Data(Vec<u8>),
    WouldBlock,
    NeedSpace(Vec<u8>),
    Eof(Vec<u8>),
}

pub struct ScriptedProducer {
    pub steps: VecDeque<Step>,
    outcomes: Outcomes,
}

impl ScriptedProducer {
    pub fn new(steps: Vec<Step>, outcomes: Outcomes) -> Self {
        Self {
            steps: steps.into(),
            outcomes,
        }
    }
}

impl DataProducer for ScriptedProducer {
    fn pull(&mut self, buf: &mut [u8]) -> Result<Pull, SelectionError> {
        let Some(step) = self.steps.pop_front() else {
            return Ok(Pull::WouldBlock);
        };
        let mut copy = |bytes: &[u8]| {
            assert!(
                bytes.len() <= buf.len(),
                "scripted step larger than the spare buffer"
            );
            buf[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        };
        Ok(match step {
            Step::Data(bytes) => Pull::Data(copy(&bytes)),
            Step::WouldBlock => Pull::WouldBlock,
            Step::NeedSpace(bytes) => Pull::NeedSpace(copy(&bytes)),
            Step::Eof(bytes) => Pull::Eof(copy(&bytes)),
        })
    }

    fn close(&mut self, outcome: TransferOutcome) {
        self.outcomes.borrow_mut().push(outcome);
    }
}

/// Selection source handing out [`VecProducer`]s over a fixed value.
pub struct VecSource {
    pub data: Vec<u8>,
    pub outcomes: Outcomes,
}

impl SelectionSource for VecSource {
    fn start(&mut self, _target: Atom) -> Result<Box<dyn DataProducer>, SelectionError> {
        Ok(Box::new(VecProducer::new(
            self.data.clone(),
            self.outcomes.clone(),
        )))
    }
}

/// Selection source whose producers never yield any bytes.
pub struct StallSource {
    pub outcomes: Outcomes,
}

impl SelectionSource for StallSource {
    fn start(&mut self, _target: Atom) -> Result<Box<dyn DataProducer>, SelectionError> {
        Ok(Box::new(ScriptedProducer::new(
            Vec::new(),
            self.outcomes.clone(),
        )))
    }
}

/// Owns `CLIPBOARD` at `time` offering `targets`, backed by `data`.
pub fn own_clipboard(engine: &mut TestEngine, time: Timestamp, targets: &[Atom], data: &[u8]) -> Outcomes {
    let produced = outcomes();
    engine
        .own(
            CLIPBOARD,
            time,
            targets.to_vec(),
            Box::new(VecSource {
                data: data.to_vec(),
                outcomes: produced.clone(),
            }),
        )
        .expect("own failed");
    produced
}
