//! Wire-level vocabulary shared by the transfer engines
//!
//! The engine itself never talks to an X server directly; everything it
//! needs from the wire is expressed through the [`Transport`] trait, and
//! everything the wire needs to tell it arrives as a [`SelectionEvent`].
//! The production implementation lives in [`crate::wire`]; tests drive the
//! engine with a scripted in-memory transport.

use crate::error::SelectionError;

pub use x11rb::protocol::xproto::{Atom, Timestamp, Window};

/// The protocol's "now" sentinel; never considered stale.
pub const CURRENT_TIME: Timestamp = 0;

/// Atoms the engine interns beyond the predefined protocol set.
#[derive(Debug, Clone, Copy)]
pub struct SelectionAtoms {
    /// Marker type announcing an incremental transfer.
    pub incr: Atom,
    /// Reflexive target: list of supported conversion targets.
    pub targets: Atom,
    /// Reflexive target: selection acquisition time.
    pub timestamp: Atom,
    /// Batched conversion request.
    pub multiple: Atom,
    /// Type of the (target, property) pair array in a batch request.
    pub atom_pair: Atom,
}

/// What a property-changed event reports about the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyEdit {
    NewValue,
    Deleted,
}

/// The three protocol event kinds that drive the engine.
#[derive(Debug, Clone, Copy)]
pub enum SelectionEvent {
    /// A requestor asks us to convert a selection we own (SelectionRequest).
    ConvertRequested {
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    },

    /// An owner answered one of our conversion requests (SelectionNotify).
    /// `property` is zero when the conversion was refused.
    ConversionDone {
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    },

    /// A property changed on the transfer window or a watched requestor
    /// window (PropertyNotify).
    PropertyChanged {
        window: Window,
        property: Atom,
        edit: PropertyEdit,
        time: Timestamp,
    },
}

/// Result of a zero-length length/type probe of a property.
///
/// `ty` is zero when the property does not exist; an absent property and an
/// empty one are equivalent to the engine.
#[derive(Debug, Clone, Copy)]
pub struct PropertyProbe {
    pub ty: Atom,
    pub format: u8,
    pub bytes_total: usize,
}

/// One bounded slice of a property value.
#[derive(Debug, Clone)]
pub struct PropertyChunk {
    pub ty: Atom,
    pub data: Vec<u8>,
    /// Bytes still stored in the property past this slice.
    pub remaining: usize,
}

/// The bounded wire operations the engine issues.
///
/// Contract notes:
/// - `read_property` consumes with a cursor: the property is deleted by the
///   server once a `delete` read drains the last byte, which is how chunk
///   completion is signalled back to the engine. Property traffic travels
///   in 32-bit units, so a production transport may round `max_bytes` up to
///   a whole unit.
/// - `max_transfer_bytes` is queried once at engine construction and cached.
/// - `intern_slot_property` mints the permanently named property used by
///   transfer slot `index`; names are never reused for anything else.
pub trait Transport {
    /// The window all outbound conversions are requested on.
    fn transfer_window(&self) -> Window;

    /// Largest property read or write the transport carries in one request.
    fn max_transfer_bytes(&self) -> usize;

    fn intern_slot_property(&mut self, index: u64) -> Result<Atom, SelectionError>;

    fn set_selection_owner(
        &mut self,
        selection: Atom,
        owner: Option<Window>,
        time: Timestamp,
    ) -> Result<(), SelectionError>;

    fn convert_selection(
        &mut self,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), SelectionError>;

    fn probe_property(
        &mut self,
        window: Window,
        property: Atom,
    ) -> Result<PropertyProbe, SelectionError>;

    fn read_property(
        &mut self,
        window: Window,
        property: Atom,
        byte_offset: usize,
        max_bytes: usize,
        delete: bool,
    ) -> Result<PropertyChunk, SelectionError>;

    /// Reads a whole format-32 value as host words (batch pair arrays).
    fn read_property_words(
        &mut self,
        window: Window,
        property: Atom,
    ) -> Result<Vec<u32>, SelectionError>;

    fn write_property(
        &mut self,
        window: Window,
        property: Atom,
        ty: Atom,
        data: &[u8],
    ) -> Result<(), SelectionError>;

    fn write_property_words(
        &mut self,
        window: Window,
        property: Atom,
        ty: Atom,
        words: &[u32],
    ) -> Result<(), SelectionError>;

    fn delete_property(&mut self, window: Window, property: Atom) -> Result<(), SelectionError>;

    /// Sends the conversion reply; `property: None` signals refusal.
    fn send_notify(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Option<Atom>,
        time: Timestamp,
    ) -> Result<(), SelectionError>;

    /// Subscribes to (or drops) property-change events on a requestor window.
    fn watch_window(&mut self, window: Window, enable: bool) -> Result<(), SelectionError>;

    fn flush(&mut self) -> Result<(), SelectionError>;
}

/// Token identifying one armed quiescence timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Host timer facility.
///
/// The engine arms one timer per in-flight transfer and re-arms it on every
/// forward step. The host fires tokens back through
/// [`crate::SelectionEngine::timer_fired`]; firing a token that was already
/// cancelled is harmless.
pub trait TimerHost {
    fn add_timer(&mut self, delay_ms: u64, token: TimerToken);
    fn remove_timer(&mut self, token: TimerToken);
}
