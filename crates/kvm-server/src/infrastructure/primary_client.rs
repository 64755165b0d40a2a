//! The server's own screen, seen as a client of the layout.
//!
//! The server treats its local screen like any remote one: it has a
//! canonical name from the configuration and can be enabled (input is being
//! captured and routed) or disabled.

use kvm_core::event::EventTarget;
use kvm_core::screen::Screen;
use tracing::debug;

pub struct PrimaryClient {
    name: String,
    screen: Box<dyn Screen>,
    enabled: bool,
}

impl PrimaryClient {
    pub fn new(name: impl Into<String>, screen: Box<dyn Screen>) -> Self {
        let name = name.into();
        debug!("creating primary screen \"{name}\"");
        Self {
            name,
            screen,
            enabled: false,
        }
    }

    /// Canonical screen name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target of the wrapped screen's events.
    pub fn screen_target(&self) -> EventTarget {
        self.screen.event_target()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        if !self.enabled {
            self.screen.enable();
            self.enabled = true;
        }
    }

    pub fn disable(&mut self) {
        if self.enabled {
            self.screen.disable();
            self.enabled = false;
        }
    }
}

impl Drop for PrimaryClient {
    fn drop(&mut self) {
        self.disable();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_core::screen::HeadlessScreen;
    use kvm_core::EventQueue;

    #[test]
    fn test_primary_client_keeps_screen_target() {
        // Arrange
        let screen = HeadlessScreen::new(EventQueue::new());
        let target = screen.event_target();

        // Act
        let client = PrimaryClient::new("desk", Box::new(screen));

        // Assert
        assert_eq!(client.name(), "desk");
        assert_eq!(client.screen_target(), target);
        assert!(!client.is_enabled());
    }

    #[test]
    fn test_enable_and_disable_are_idempotent() {
        let mut client = PrimaryClient::new("desk", Box::new(HeadlessScreen::new(EventQueue::new())));
        client.enable();
        client.enable();
        assert!(client.is_enabled());
        client.disable();
        client.disable();
        assert!(!client.is_enabled());
    }
}
