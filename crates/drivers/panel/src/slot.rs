//! Select-once holder for the active panel.
//!
//! The backend is chosen on first access and never changes afterwards;
//! every caller gets a clone of the same `Arc`.

use alloc::sync::Arc;

use spin::{Mutex, Once};

use crate::link::PanelLink;
use crate::panel::{BackendKind, Panel};

pub struct PanelSlot<L> {
    cell: Once<Arc<Mutex<Panel<L>>>>,
}

impl<L: PanelLink> PanelSlot<L> {
    pub const fn new() -> Self {
        Self { cell: Once::new() }
    }

    /// Return the selected panel, selecting it on the first call.
    ///
    /// `make_link` only runs on that first call; `preferred` and the
    /// geometry are ignored afterwards.
    pub fn get_or_select(
        &self,
        preferred: BackendKind,
        width: u16,
        height: u16,
        make_link: impl FnOnce() -> L,
    ) -> Arc<Mutex<Panel<L>>> {
        let panel = self.cell.call_once(|| {
            Arc::new(Mutex::new(Panel::select(preferred, make_link(), width, height)))
        });
        Arc::clone(panel)
    }

    /// The selected panel, if selection already happened.
    pub fn get(&self) -> Option<Arc<Mutex<Panel<L>>>> {
        self.cell.get().map(Arc::clone)
    }
}

impl<L: PanelLink> Default for PanelSlot<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLink;

    #[test]
    fn selection_happens_once() {
        let slot: PanelSlot<SimLink> = PanelSlot::new();
        assert!(slot.get().is_none());
        let first = slot.get_or_select(BackendKind::Engine, 8, 8, || SimLink::new(8, 8, true).0);
        let mut second_ran = false;
        let second = slot.get_or_select(BackendKind::Direct, 4, 4, || {
            second_ran = true;
            SimLink::new(4, 4, false).0
        });
        assert!(!second_ran);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().kind(), BackendKind::Engine);
        assert_eq!(second.lock().width(), 8);
    }

    #[test]
    fn fallback_choice_is_cached() {
        let slot: PanelSlot<SimLink> = PanelSlot::new();
        let panel = slot.get_or_select(BackendKind::Engine, 8, 8, || SimLink::new(8, 8, false).0);
        assert_eq!(panel.lock().kind(), BackendKind::Direct);
        let again = slot.get().unwrap();
        assert!(Arc::ptr_eq(&panel, &again));
    }
}
