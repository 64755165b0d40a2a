//! The screen collaborator.
//!
//! Capturing and synthesising input is platform code that lives outside this
//! workspace.  Sessions only need to open a screen, keep it, and react to the
//! events it raises (`screen.error`, `screen.suspend`, `screen.resume`), all
//! addressed to [`Screen::event_target`].
//!
//! [`HeadlessScreen`] is the stand-in used by the binaries and tests, and
//! [`mock::ScriptedScreenFactory`] lets tests decide how each open attempt
//! ends.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::event::{names, Event, EventQueue, EventTarget};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScreenError {
    /// Temporarily unavailable (for example the display is locked).  Retry
    /// after `retry_after`.
    #[error("screen unavailable: {reason}")]
    Unavailable { reason: String, retry_after: Duration },

    /// The screen cannot be opened at all.
    #[error("cannot open screen: {0}")]
    OpenFailure(String),
}

/// An open screen.  Closing is dropping.
pub trait Screen: Send {
    /// Identity the screen's events are addressed to.
    fn event_target(&self) -> EventTarget;

    fn enable(&mut self) {}

    fn disable(&mut self) {}
}

/// Opens screens on demand.
pub trait ScreenFactory: Send {
    /// # Errors
    ///
    /// [`ScreenError::Unavailable`] for a transient failure,
    /// [`ScreenError::OpenFailure`] for a permanent one.
    fn open(&mut self, events: &Arc<EventQueue>) -> Result<Box<dyn Screen>, ScreenError>;
}

// ── Headless screen ───────────────────────────────────────────────────────────

/// A screen with no display behind it.
///
/// It raises events only when asked to, which is how watcher threads (or
/// tests) simulate the platform reporting an error or a suspend.
pub struct HeadlessScreen {
    target: EventTarget,
    events: Arc<EventQueue>,
    enabled: bool,
}

impl HeadlessScreen {
    pub fn new(events: Arc<EventQueue>) -> Self {
        Self {
            target: EventTarget::allocate(),
            events,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn raise_error(&self) {
        self.raise(names::SCREEN_ERROR);
    }

    pub fn raise_suspend(&self) {
        self.raise(names::SCREEN_SUSPEND);
    }

    pub fn raise_resume(&self) {
        self.raise(names::SCREEN_RESUME);
    }

    fn raise(&self, name: &str) {
        let kind = self.events.register_type(name);
        self.events.add_event(Event::new(kind, self.target));
    }
}

impl Screen for HeadlessScreen {
    fn event_target(&self) -> EventTarget {
        self.target
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }
}

impl Drop for HeadlessScreen {
    fn drop(&mut self) {
        debug!("closed headless screen {}", self.target);
    }
}

#[derive(Debug, Default)]
pub struct HeadlessScreenFactory;

impl ScreenFactory for HeadlessScreenFactory {
    fn open(&mut self, events: &Arc<EventQueue>) -> Result<Box<dyn Screen>, ScreenError> {
        let screen = HeadlessScreen::new(Arc::clone(events));
        debug!("opened headless screen {}", screen.event_target());
        Ok(Box::new(screen))
    }
}

// ── Test double ───────────────────────────────────────────────────────────────

/// Scripted screen factory (always compiled so integration tests in other
/// crates can use it).
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{HeadlessScreenFactory, Screen, ScreenError, ScreenFactory};
    use crate::event::{EventQueue, EventTarget};
    use crate::mt::lock;

    /// Plays back scripted open results, then opens headless screens.
    #[derive(Clone, Default)]
    pub struct ScriptedScreenFactory {
        script: Arc<Mutex<VecDeque<ScreenError>>>,
        attempts: Arc<AtomicUsize>,
        opened: Arc<Mutex<Vec<EventTarget>>>,
    }

    impl ScriptedScreenFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next open attempt fail with `error`.
        pub fn fail_next(&self, error: ScreenError) {
            lock(&self.script).push_back(error);
        }

        /// Open attempts so far, successful or not.
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Targets of every screen opened so far.
        pub fn opened(&self) -> Vec<EventTarget> {
            lock(&self.opened).clone()
        }
    }

    impl ScreenFactory for ScriptedScreenFactory {
        fn open(&mut self, events: &Arc<EventQueue>) -> Result<Box<dyn Screen>, ScreenError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = lock(&self.script).pop_front() {
                return Err(error);
            }
            let screen = HeadlessScreenFactory.open(events)?;
            lock(&self.opened).push(screen.event_target());
            Ok(screen)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::mock::ScriptedScreenFactory;
    use super::*;

    #[test]
    fn test_headless_screen_raises_targeted_events() {
        // Arrange
        let events = EventQueue::new();
        let screen = HeadlessScreen::new(Arc::clone(&events));

        // Act
        screen.raise_suspend();
        let event = events.get_event(Some(Duration::from_secs(1))).expect("event");

        // Assert
        assert_eq!(event.kind(), events.register_type(names::SCREEN_SUSPEND));
        assert_eq!(event.target(), screen.event_target());
    }

    #[test]
    fn test_scripted_factory_fails_then_opens() {
        // Arrange
        let events = EventQueue::new();
        let mut factory = ScriptedScreenFactory::new();
        factory.fail_next(ScreenError::OpenFailure("no display".into()));

        // Act
        let first = factory.open(&events);
        let second = factory.open(&events);

        // Assert
        assert!(matches!(first, Err(ScreenError::OpenFailure(_))));
        assert!(second.is_ok());
        assert_eq!(factory.attempts(), 2);
        assert_eq!(factory.opened().len(), 1);
    }

    #[test]
    fn test_enable_disable_toggle() {
        let mut screen = HeadlessScreen::new(EventQueue::new());
        screen.enable();
        assert!(screen.is_enabled());
        screen.disable();
        assert!(!screen.is_enabled());
    }
}
