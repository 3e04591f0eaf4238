//! Trigger sources: global hotkey and UI actions.
//!
//! Both input channels produce timestamped [`TriggerEvent`]s into one
//! unbounded, ordered channel consumed solely by the session controller.
//! Producers never block on the controller; conflicting events are the
//! controller's problem to reject, not the listener's to queue.

use anyhow::{anyhow, Context, Result};
use global_hotkey::{
    hotkey::{Code, HotKey, Modifiers},
    GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState,
};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::HotkeySettings;

/// Logical signals a trigger can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSignal {
    /// Explicit start request (UI).
    Start,
    /// Explicit stop request (UI).
    Stop,
    /// Hotkey toggle; resolved against controller state (idle → start,
    /// recording → stop, otherwise dropped).
    Toggle,
}

/// Which channel produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    /// Global hotkey listener.
    Hotkey,
    /// UI action.
    Ui,
}

/// One timestamped trigger event.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    /// The logical signal.
    pub signal: TriggerSignal,
    /// Producing channel.
    pub origin: TriggerOrigin,
    /// Production time; channel delivery preserves this order.
    pub at: SystemTime,
}

impl TriggerEvent {
    fn now(signal: TriggerSignal, origin: TriggerOrigin) -> Self {
        Self {
            signal,
            origin,
            at: SystemTime::now(),
        }
    }
}

/// Creates the ordered trigger channel consumed by the controller.
#[must_use]
pub fn channel() -> (
    mpsc::UnboundedSender<TriggerEvent>,
    mpsc::UnboundedReceiver<TriggerEvent>,
) {
    mpsc::unbounded_channel()
}

/// UI-side trigger handle (the menu-item seam).
#[derive(Clone)]
pub struct ManualTrigger {
    sender: mpsc::UnboundedSender<TriggerEvent>,
}

impl ManualTrigger {
    /// Wraps a sender end of the trigger channel.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<TriggerEvent>) -> Self {
        Self { sender }
    }

    /// Requests a session start.
    pub fn request_start(&self) {
        let _ = self
            .sender
            .send(TriggerEvent::now(TriggerSignal::Start, TriggerOrigin::Ui));
    }

    /// Requests a session stop.
    pub fn request_stop(&self) {
        let _ = self
            .sender
            .send(TriggerEvent::now(TriggerSignal::Stop, TriggerOrigin::Ui));
    }
}

/// Global hotkey listener producing toggle events.
///
/// One combo is bound at a time; re-binding replaces the previous
/// registration atomically from the listener's point of view.
pub struct HotkeyTrigger {
    manager: GlobalHotKeyManager,
    hotkey: HotKey,
    sender: mpsc::UnboundedSender<TriggerEvent>,
}

impl HotkeyTrigger {
    /// Registers the configured combo.
    ///
    /// # Errors
    /// Returns an error if the combo fails to parse or the OS input hook
    /// rejects the registration.
    pub fn new(
        settings: &HotkeySettings,
        sender: mpsc::UnboundedSender<TriggerEvent>,
    ) -> Result<Self> {
        let manager = GlobalHotKeyManager::new().context("failed to create hotkey manager")?;

        let hotkey = parse_binding(settings)?;
        manager
            .register(hotkey)
            .context("failed to register hotkey")?;

        info!(
            "registered hotkey: {:?} + {}",
            settings.modifiers, settings.key
        );

        Ok(Self {
            manager,
            hotkey,
            sender,
        })
    }

    /// Replaces the bound combo. The old binding is gone before the new one
    /// is live; on failure the previous combo stays unbound rather than
    /// half-registered.
    ///
    /// # Errors
    /// Same failure modes as [`HotkeyTrigger::new`].
    pub fn rebind(&mut self, settings: &HotkeySettings) -> Result<()> {
        let new_hotkey = parse_binding(settings)?;
        self.manager
            .unregister(self.hotkey)
            .context("failed to unregister previous hotkey")?;
        self.manager
            .register(new_hotkey)
            .context("failed to register hotkey")?;
        self.hotkey = new_hotkey;
        info!("rebound hotkey: {:?} + {}", settings.modifiers, settings.key);
        Ok(())
    }

    /// Forwards a raw hotkey event as a toggle. Press-only; releases are
    /// ignored.
    pub fn handle_event(&self, event: &GlobalHotKeyEvent) {
        if event.id != self.hotkey.id() {
            return;
        }
        if event.state != HotKeyState::Pressed {
            return;
        }
        debug!("hotkey pressed, emitting toggle");
        let _ = self.sender.send(TriggerEvent::now(
            TriggerSignal::Toggle,
            TriggerOrigin::Hotkey,
        ));
    }
}

impl Drop for HotkeyTrigger {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unregister(self.hotkey) {
            tracing::error!("failed to unregister hotkey: {}", e);
        }
    }
}

fn parse_binding(settings: &HotkeySettings) -> Result<HotKey> {
    let modifiers = parse_modifiers(&settings.modifiers)?;
    let code = parse_key(&settings.key)?;
    Ok(HotKey::new(Some(modifiers), code))
}

fn parse_modifiers(modifiers: &[String]) -> Result<Modifiers> {
    let mut result = Modifiers::empty();
    for modifier in modifiers {
        match modifier.as_str() {
            "Control" | "Ctrl" => result |= Modifiers::CONTROL,
            "Option" | "Alt" => result |= Modifiers::ALT,
            "Command" | "Super" => result |= Modifiers::SUPER,
            "Shift" => result |= Modifiers::SHIFT,
            other => return Err(anyhow!("unknown hotkey modifier: {other}")),
        }
    }
    Ok(result)
}

fn parse_key(key: &str) -> Result<Code> {
    let code = match key {
        "A" => Code::KeyA,
        "B" => Code::KeyB,
        "C" => Code::KeyC,
        "D" => Code::KeyD,
        "E" => Code::KeyE,
        "F" => Code::KeyF,
        "G" => Code::KeyG,
        "H" => Code::KeyH,
        "I" => Code::KeyI,
        "J" => Code::KeyJ,
        "K" => Code::KeyK,
        "L" => Code::KeyL,
        "M" => Code::KeyM,
        "N" => Code::KeyN,
        "O" => Code::KeyO,
        "P" => Code::KeyP,
        "Q" => Code::KeyQ,
        "R" => Code::KeyR,
        "S" => Code::KeyS,
        "T" => Code::KeyT,
        "U" => Code::KeyU,
        "V" => Code::KeyV,
        "W" => Code::KeyW,
        "X" => Code::KeyX,
        "Y" => Code::KeyY,
        "Z" => Code::KeyZ,
        other => return Err(anyhow!("unsupported hotkey key: {other}")),
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_modifier() {
        let result = parse_modifiers(&["Control".to_owned()]).unwrap();
        assert_eq!(result, Modifiers::CONTROL);
    }

    #[test]
    fn parse_modifier_aliases() {
        assert_eq!(
            parse_modifiers(&["Ctrl".to_owned()]).unwrap(),
            Modifiers::CONTROL
        );
        assert_eq!(parse_modifiers(&["Alt".to_owned()]).unwrap(), Modifiers::ALT);
        assert_eq!(
            parse_modifiers(&["Super".to_owned()]).unwrap(),
            Modifiers::SUPER
        );
    }

    #[test]
    fn parse_combined_modifiers() {
        let result = parse_modifiers(&["Control".to_owned(), "Shift".to_owned()]).unwrap();
        assert!(result.contains(Modifiers::CONTROL));
        assert!(result.contains(Modifiers::SHIFT));
    }

    #[test]
    fn parse_unknown_modifier_fails() {
        assert!(parse_modifiers(&["Hyper".to_owned()]).is_err());
    }

    #[test]
    fn parse_known_keys() {
        assert!(matches!(parse_key("Z"), Ok(Code::KeyZ)));
        assert!(matches!(parse_key("A"), Ok(Code::KeyA)));
    }

    #[test]
    fn parse_unknown_key_fails() {
        assert!(parse_key("F13").is_err());
        assert!(parse_key("").is_err());
    }

    #[tokio::test]
    async fn manual_trigger_preserves_order() {
        let (tx, mut rx) = channel();
        let trigger = ManualTrigger::new(tx);

        trigger.request_start();
        trigger.request_stop();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.signal, TriggerSignal::Start);
        assert_eq!(second.signal, TriggerSignal::Stop);
        assert_eq!(first.origin, TriggerOrigin::Ui);
        assert!(first.at <= second.at);
    }

    #[tokio::test]
    async fn manual_trigger_send_never_blocks_without_consumer() {
        let (tx, rx) = channel();
        let trigger = ManualTrigger::new(tx);
        for _ in 0..1000 {
            trigger.request_start();
        }
        drop(rx);
        // Sends after the receiver is gone are dropped, not panics.
        trigger.request_stop();
    }

    #[test]
    #[ignore = "requires an OS input hook"]
    fn hotkey_registration() {
        let (tx, _rx) = channel();
        let settings = HotkeySettings {
            modifiers: vec!["Control".to_owned(), "Option".to_owned()],
            key: "Z".to_owned(),
        };
        let trigger = HotkeyTrigger::new(&settings, tx);
        assert!(trigger.is_ok());
    }
}
