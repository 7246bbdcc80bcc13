//! x11rb-backed transport
//!
//! The production [`Transport`]: a 1x1 unmapped transfer window, the
//! engine's interned atoms, and bounded property traffic over an x11rb
//! connection. The host keeps pulling events from the connection (directly
//! or through [`WireTransport::wait_for_event`]) and feeds the translated
//! ones into the engine.

use log::debug;

use x11rb::atom_manager;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ConnectionExt, CreateWindowAux, EventMask, PropMode,
    Property, SelectionNotifyEvent, WindowClass, SELECTION_NOTIFY_EVENT,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, NONE};

use crate::error::SelectionError;
use crate::proto::{
    Atom, PropertyChunk, PropertyEdit, PropertyProbe, SelectionAtoms, SelectionEvent, Timestamp,
    Transport, Window,
};

// Atoms interned once at connection setup.
atom_manager! {
    pub WireAtoms: WireAtomsCookie {
        INCR,
        TARGETS,
        TIMESTAMP,
        MULTIPLE,
        ATOM_PAIR,
    }
}

impl From<WireAtoms> for SelectionAtoms {
    fn from(atoms: WireAtoms) -> Self {
        Self {
            incr: atoms.INCR,
            targets: atoms.TARGETS,
            timestamp: atoms.TIMESTAMP,
            multiple: atoms.MULTIPLE,
            atom_pair: atoms.ATOM_PAIR,
        }
    }
}

fn wire_err<E: std::fmt::Display>(err: E) -> SelectionError {
    SelectionError::Transport(err.to_string())
}

/// Transport over a live X connection.
pub struct WireTransport<C: Connection> {
    conn: C,
    window: Window,
    max_bytes: usize,
}

impl WireTransport<RustConnection> {
    /// Connects to the display and sets up the transfer window.
    pub fn connect(dpy_name: Option<&str>) -> Result<(Self, SelectionAtoms), SelectionError> {
        let (conn, screen_num) = x11rb::connect(dpy_name).map_err(wire_err)?;
        Self::with_connection(conn, screen_num)
    }
}

impl<C: Connection> WireTransport<C> {
    /// Wraps an existing connection: creates the 1x1 transfer window,
    /// interns the engine's atoms, and sizes the transfer quantum from the
    /// server's maximum request length.
    pub fn with_connection(
        conn: C,
        screen_num: usize,
    ) -> Result<(Self, SelectionAtoms), SelectionError> {
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_else(|| SelectionError::Transport(format!("no screen {}", screen_num)))?
            .root;

        let window = conn.generate_id().map_err(wire_err)?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::COPY_FROM_PARENT,
            COPY_FROM_PARENT,
            // Property events on this window drive the read side.
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )
        .map_err(wire_err)?;

        let atoms = WireAtoms::new(&conn)
            .map_err(wire_err)?
            .reply()
            .map_err(wire_err)?;
        conn.flush().map_err(wire_err)?;

        // Leave slack for the request header and keep the bound word aligned.
        let max_bytes = (conn.maximum_request_bytes().saturating_sub(1024)).max(4096) & !3;
        debug!(
            "🔌 Selection transfer window {:#x} ready (quantum {} bytes)",
            window, max_bytes
        );

        Ok((
            Self {
                conn,
                window,
                max_bytes,
            },
            atoms.into(),
        ))
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Blocks for the next X event and translates it for the engine;
    /// `None` for events the engine does not consume.
    pub fn wait_for_event(&mut self) -> Result<Option<SelectionEvent>, SelectionError> {
        let event = self.conn.wait_for_event().map_err(wire_err)?;
        Ok(translate_event(&event))
    }
}

/// Maps the three relevant X event kinds onto engine events.
pub fn translate_event(event: &Event) -> Option<SelectionEvent> {
    match event {
        Event::SelectionRequest(e) => Some(SelectionEvent::ConvertRequested {
            requestor: e.requestor,
            selection: e.selection,
            target: e.target,
            property: e.property,
            time: e.time,
        }),
        Event::SelectionNotify(e) => Some(SelectionEvent::ConversionDone {
            selection: e.selection,
            target: e.target,
            property: e.property,
            time: e.time,
        }),
        Event::PropertyNotify(e) => {
            let edit = if e.state == Property::DELETE {
                PropertyEdit::Deleted
            } else {
                PropertyEdit::NewValue
            };
            Some(SelectionEvent::PropertyChanged {
                window: e.window,
                property: e.atom,
                edit,
                time: e.time,
            })
        }
        _ => None,
    }
}

impl<C: Connection> Transport for WireTransport<C> {
    fn transfer_window(&self) -> Window {
        self.window
    }

    fn max_transfer_bytes(&self) -> usize {
        self.max_bytes
    }

    fn intern_slot_property(&mut self, index: u64) -> Result<Atom, SelectionError> {
        let name = format!("_PRISM_TRANSFER_{}", index);
        let atom = self
            .conn
            .intern_atom(false, name.as_bytes())
            .map_err(wire_err)?
            .reply()
            .map_err(wire_err)?
            .atom;
        Ok(atom)
    }

    fn set_selection_owner(
        &mut self,
        selection: Atom,
        owner: Option<Window>,
        time: Timestamp,
    ) -> Result<(), SelectionError> {
        self.conn
            .set_selection_owner(owner.unwrap_or(NONE), selection, time)
            .map_err(wire_err)?;
        Ok(())
    }

    fn convert_selection(
        &mut self,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), SelectionError> {
        self.conn
            .convert_selection(self.window, selection, target, property, time)
            .map_err(wire_err)?;
        Ok(())
    }

    fn probe_property(
        &mut self,
        window: Window,
        property: Atom,
    ) -> Result<PropertyProbe, SelectionError> {
        let reply = self
            .conn
            .get_property(false, window, property, AtomEnum::ANY, 0, 0)
            .map_err(wire_err)?
            .reply()
            .map_err(wire_err)?;
        Ok(PropertyProbe {
            ty: reply.type_,
            format: reply.format,
            bytes_total: reply.bytes_after as usize,
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
        // Offsets and lengths travel in 32-bit units; the server deletes the
        // property only once a delete-read drains the last byte.
        let offset_words = (byte_offset / 4) as u32;
        let len_words = ((max_bytes + 3) / 4).max(1) as u32;
        let reply = self
            .conn
            .get_property(delete, window, property, AtomEnum::ANY, offset_words, len_words)
            .map_err(wire_err)?
            .reply()
            .map_err(wire_err)?;
        Ok(PropertyChunk {
            ty: reply.type_,
            data: reply.value,
            remaining: reply.bytes_after as usize,
        })
    }

    fn read_property_words(
        &mut self,
        window: Window,
        property: Atom,
    ) -> Result<Vec<u32>, SelectionError> {
        let reply = self
            .conn
            .get_property(false, window, property, AtomEnum::ANY, 0, u32::MAX / 4)
            .map_err(wire_err)?
            .reply()
            .map_err(wire_err)?;
        if reply.format != 32 {
            return Err(SelectionError::Malformed(format!(
                "expected a format-32 property, got format {}",
                reply.format
            )));
        }
        reply
            .value32()
            .map(|words| words.collect())
            .ok_or_else(|| SelectionError::Malformed("property is not a 32-bit value".into()))
    }

    fn write_property(
        &mut self,
        window: Window,
        property: Atom,
        ty: Atom,
        data: &[u8],
    ) -> Result<(), SelectionError> {
        self.conn
            .change_property8(PropMode::REPLACE, window, property, ty, data)
            .map_err(wire_err)?;
        Ok(())
    }

    fn write_property_words(
        &mut self,
        window: Window,
        property: Atom,
        ty: Atom,
        words: &[u32],
    ) -> Result<(), SelectionError> {
        self.conn
            .change_property32(PropMode::REPLACE, window, property, ty, words)
            .map_err(wire_err)?;
        Ok(())
    }

    fn delete_property(&mut self, window: Window, property: Atom) -> Result<(), SelectionError> {
        self.conn.delete_property(window, property).map_err(wire_err)?;
        Ok(())
    }

    fn send_notify(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Option<Atom>,
        time: Timestamp,
    ) -> Result<(), SelectionError> {
        let event = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time,
            requestor,
            selection,
            target,
            property: property.unwrap_or(NONE),
        };
        self.conn
            .send_event(false, requestor, EventMask::NO_EVENT, event)
            .map_err(wire_err)?;
        Ok(())
    }

    fn watch_window(&mut self, window: Window, enable: bool) -> Result<(), SelectionError> {
        let mask = if enable {
            EventMask::PROPERTY_CHANGE
        } else {
            EventMask::NO_EVENT
        };
        self.conn
            .change_window_attributes(window, &ChangeWindowAttributesAux::new().event_mask(mask))
            .map_err(wire_err)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SelectionError> {
        self.conn.flush().map_err(wire_err)
    }
}
