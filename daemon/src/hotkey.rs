/// Global shortcut listener using a low-level Windows keyboard hook (`WH_KEYBOARD_LL`).
///
/// The hook runs on a dedicated OS thread with its own Windows message pump, so it
/// fires even when a full-screen game has focus.  Key presses are matched against
/// a [`Keymap`] that can be swapped atomically at runtime, and a capture mode
/// grabs the next key press for rebinding.  The hook thread exits cleanly when
/// [`HotkeyChannel::stop`] is called.
///
/// On non-Windows platforms the public API compiles but no key presses arrive.
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::KeyShortcuts;
use crate::event::{CoreEvent, CoreSender};

/// Keymap consulted by the hook callback.  Set by [`HotkeyChannel::start`].
static ACTIVE: RwLock<Option<Arc<Keymap>>> = RwLock::new(None);

/// What a shortcut does to the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeyAction {
    Increase,
    Decrease,
    Cancel,
}

impl HotkeyAction {
    pub const ALL: [HotkeyAction; 3] =
        [HotkeyAction::Increase, HotkeyAction::Decrease, HotkeyAction::Cancel];

    /// Field name under `[global.key_shortcuts]`.
    pub fn config_key(self) -> &'static str {
        match self {
            HotkeyAction::Increase => "timer_up",
            HotkeyAction::Decrease => "timer_down",
            HotkeyAction::Cancel => "timer_stop",
        }
    }

    /// Accepts `up`/`down`/`stop` as well as the config key names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "up" | "increase" | "timer_up" => Some(HotkeyAction::Increase),
            "down" | "decrease" | "timer_down" => Some(HotkeyAction::Decrease),
            "stop" | "cancel" | "timer_stop" => Some(HotkeyAction::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum HotkeyError {
    #[error("Unknown key '{0}'")]
    UnknownKey(String),
    #[error("'{0}' has only modifiers and no key")]
    NoKey(String),
    #[error("'{0}' names more than one key")]
    MultipleKeys(String),
}

// ── Key names ─────────────────────────────────────────────────────────────────

/// Canonical key names and their Windows virtual-key codes.
const NAMED_KEYS: &[(&str, u32)] = &[
    ("backspace", 0x08),
    ("tab", 0x09),
    ("enter", 0x0D),
    ("pause", 0x13),
    ("caps lock", 0x14),
    ("esc", 0x1B),
    ("space", 0x20),
    ("page up", 0x21),
    ("page down", 0x22),
    ("end", 0x23),
    ("home", 0x24),
    ("left", 0x25),
    ("up", 0x26),
    ("right", 0x27),
    ("down", 0x28),
    ("print screen", 0x2C),
    ("insert", 0x2D),
    ("delete", 0x2E),
    ("num 0", 0x60),
    ("num 1", 0x61),
    ("num 2", 0x62),
    ("num 3", 0x63),
    ("num 4", 0x64),
    ("num 5", 0x65),
    ("num 6", 0x66),
    ("num 7", 0x67),
    ("num 8", 0x68),
    ("num 9", 0x69),
    ("num multiply", 0x6A),
    ("num plus", 0x6B),
    ("num minus", 0x6D),
    ("num decimal", 0x6E),
    ("num divide", 0x6F),
    ("num lock", 0x90),
    ("scroll lock", 0x91),
    (";", 0xBA),
    ("=", 0xBB),
    (",", 0xBC),
    ("-", 0xBD),
    (".", 0xBE),
    ("/", 0xBF),
    ("`", 0xC0),
    ("[", 0xDB),
    ("\\", 0xDC),
    ("]", 0xDD),
    ("'", 0xDE),
];

const ALIASES: &[(&str, &str)] = &[
    ("pageup", "page up"),
    ("pgup", "page up"),
    ("pagedown", "page down"),
    ("pgdn", "page down"),
    ("escape", "esc"),
    ("return", "enter"),
    ("del", "delete"),
    ("ins", "insert"),
    ("spacebar", "space"),
];

/// Converts a key name (e.g. `"F8"`, `"page up"`, `"A"`) to a Windows virtual-key code.
///
/// Supported keys:
/// - Function keys `F1`–`F24` (case-insensitive).
/// - ASCII letters `A`–`Z` (normalised to their uppercase VK values, `0x41`–`0x5A`).
/// - ASCII digits `0`–`9` (VK values `0x30`–`0x39`).
/// - Navigation, editing, numpad and punctuation keys by name (see `NAMED_KEYS`).
/// - Raw codes written as hex, e.g. `"0xA6"`.
///
/// Returns `None` for any unrecognised name.
pub fn parse_vk(name: &str) -> Option<u32> {
    let normalised = name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let key = ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalised)
        .map_or(normalised.as_str(), |(_, canonical)| canonical);

    if let Some(&(_, vk)) = NAMED_KEYS.iter().find(|(n, _)| *n == key) {
        return Some(vk);
    }
    if let Some(hex) = key.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok().filter(|vk| (1..=0xFE).contains(vk));
    }
    if let Some(n) = key.strip_prefix('f').and_then(|n| n.parse::<u32>().ok()) {
        return (1..=24).contains(&n).then_some(0x6F + n);
    }

    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        // 'A'=0x41…'Z'=0x5A; '0'=0x30…'9'=0x39, same as the Windows VK codes.
        (Some(c), None) if c.is_ascii_alphanumeric() => Some(c.to_ascii_uppercase() as u32),
        _ => None,
    }
}

/// Name for a virtual-key code that [`parse_vk`] maps back to the same code.
pub fn key_name(vk: u32) -> String {
    if let Some(&(name, _)) = NAMED_KEYS.iter().find(|(_, code)| *code == vk) {
        return name.to_string();
    }
    match vk {
        0x70..=0x87 => format!("f{}", vk - 0x6F),
        0x30..=0x39 | 0x41..=0x5A => char::from_u32(vk)
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_else(|| format!("0x{vk:02x}")),
        _ => format!("0x{vk:02x}"),
    }
}

/// Shift, Ctrl, Alt and Windows keys, in both generic and left/right forms.
pub fn is_modifier_vk(vk: u32) -> bool {
    matches!(vk, 0x10..=0x12 | 0x5B | 0x5C | 0xA0..=0xA5)
}

// ── Key combinations ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
}

/// A key plus the modifiers that must be held with it, e.g. `ctrl+shift+f5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCombo {
    pub vk: u32,
    pub modifiers: Modifiers,
}

impl FromStr for KeyCombo {
    type Err = HotkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut modifiers = Modifiers::default();
        let mut vk = None;
        for part in s.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "ctrl" | "control" => modifiers.ctrl = true,
                "shift" => modifiers.shift = true,
                "alt" => modifiers.alt = true,
                _ => {
                    let code = parse_vk(part).ok_or_else(|| HotkeyError::UnknownKey(part.to_string()))?;
                    if vk.replace(code).is_some() {
                        return Err(HotkeyError::MultipleKeys(s.to_string()));
                    }
                }
            }
        }
        let vk = vk.ok_or_else(|| HotkeyError::NoKey(s.to_string()))?;
        Ok(Self { vk, modifiers })
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.ctrl {
            f.write_str("ctrl+")?;
        }
        if self.modifiers.shift {
            f.write_str("shift+")?;
        }
        if self.modifiers.alt {
            f.write_str("alt+")?;
        }
        f.write_str(&key_name(self.vk))
    }
}

// ── Keymap ────────────────────────────────────────────────────────────────────

/// The bindings the hook matches against, plus the pending capture request.
pub struct Keymap {
    bindings: RwLock<Vec<(KeyCombo, HotkeyAction)>>,
    capture: Mutex<Option<HotkeyAction>>,
    tx: CoreSender,
}

impl Keymap {
    fn new(tx: CoreSender) -> Self {
        Self { bindings: RwLock::new(Vec::new()), capture: Mutex::new(None), tx }
    }

    /// Parses every shortcut and swaps the whole set in at once. Shortcuts that
    /// fail to parse or collide with an earlier one are logged and skipped.
    /// Returns the number of bindings now active.
    pub fn replace(&self, shortcuts: &KeyShortcuts) -> usize {
        let mut next: Vec<(KeyCombo, HotkeyAction)> = Vec::with_capacity(3);
        for (action, key) in shortcuts.iter() {
            let combo = match key.parse::<KeyCombo>() {
                Ok(combo) => combo,
                Err(e) => {
                    warn!("[hotkey] Not binding {}: {e}", action.config_key());
                    continue;
                }
            };
            if let Some((_, taken_by)) = next.iter().find(|(c, _)| *c == combo) {
                warn!(
                    "[hotkey] '{combo}' is already bound to {}; not binding {}",
                    taken_by.config_key(),
                    action.config_key()
                );
                continue;
            }
            debug!("[hotkey] {} -> {combo}", action.config_key());
            next.push((combo, action));
        }
        let count = next.len();
        *self.bindings.write().unwrap_or_else(PoisonError::into_inner) = next;
        count
    }

    /// The next non-modifier key press is reported as `KeyCaptured` instead of
    /// being matched.
    pub fn begin_capture(&self, action: HotkeyAction) {
        *self.capture.lock().unwrap_or_else(PoisonError::into_inner) = Some(action);
    }

    /// Handles one key-down. Returns true when the press should be swallowed.
    pub fn on_key_down(&self, vk: u32, modifiers: Modifiers) -> bool {
        if is_modifier_vk(vk) {
            return false;
        }

        let captured = self.capture.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(action) = captured {
            let key = KeyCombo { vk, modifiers }.to_string();
            let _ = self.tx.send(CoreEvent::KeyCaptured { action, key });
            return true;
        }

        let action = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(combo, _)| combo.vk == vk && combo.modifiers == modifiers)
            .map(|(_, action)| *action);
        if let Some(action) = action {
            let _ = self.tx.send(CoreEvent::Hotkey(action));
        }
        false
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// A handle to the keymap and, once started, the keyboard hook thread.
pub struct HotkeyChannel {
    keymap: Arc<Keymap>,
    /// Message-pump thread and its ID, used to post `WM_QUIT`.
    #[cfg(windows)]
    pump: Option<(std::thread::JoinHandle<()>, u32)>,
}

impl HotkeyChannel {
    /// Builds the keymap without installing the system hook.
    pub fn new(shortcuts: &KeyShortcuts, tx: CoreSender) -> Self {
        let keymap = Arc::new(Keymap::new(tx));
        keymap.replace(shortcuts);
        Self {
            keymap,
            #[cfg(windows)]
            pump: None,
        }
    }

    /// Builds the keymap and installs a `WH_KEYBOARD_LL` hook on a dedicated
    /// OS thread.  A failure to install the hook is logged; the daemon keeps
    /// running without global shortcuts.
    pub fn start(shortcuts: &KeyShortcuts, tx: CoreSender) -> Self {
        let channel = Self::new(shortcuts, tx);
        *ACTIVE.write().unwrap_or_else(PoisonError::into_inner) = Some(channel.keymap.clone());

        #[cfg(windows)]
        let channel = Self { pump: imp::spawn_pump(), ..channel };

        #[cfg(not(windows))]
        warn!("[hotkey] Global shortcuts are only supported on Windows");

        channel
    }

    /// Replaces all bindings at once. Returns the number now active.
    pub fn register(&self, shortcuts: &KeyShortcuts) -> usize {
        self.keymap.replace(shortcuts)
    }

    pub fn capture_next(&self, action: HotkeyAction) {
        self.keymap.begin_capture(action);
    }

    #[cfg(test)]
    pub fn keymap(&self) -> &Keymap {
        &self.keymap
    }

    /// Signals the hook thread to stop and blocks until it exits.
    pub fn stop(self) {
        #[cfg(windows)]
        if let Some((thread, thread_id)) = self.pump {
            imp::post_quit(thread_id);
            let _ = thread.join();
        }

        let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|k| Arc::ptr_eq(k, &self.keymap)) {
            *active = None;
        }
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::sync::mpsc as std_mpsc;
    use std::sync::PoisonError;
    use std::thread::JoinHandle;

    use tracing::{debug, error, warn};
    use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        GetAsyncKeyState, VIRTUAL_KEY, VK_CONTROL, VK_MENU, VK_SHIFT,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        CallNextHookEx, DispatchMessageW, GetMessageW, PostThreadMessageW,
        SetWindowsHookExW, UnhookWindowsHookEx,
        KBDLLHOOKSTRUCT, MSG, WH_KEYBOARD_LL, WM_KEYDOWN, WM_QUIT, WM_SYSKEYDOWN,
    };

    use super::{Modifiers, ACTIVE};

    fn held(vk: VIRTUAL_KEY) -> bool {
        // High bit set: key is down right now.
        unsafe { GetAsyncKeyState(i32::from(vk.0)) < 0 }
    }

    fn current_modifiers() -> Modifiers {
        Modifiers { ctrl: held(VK_CONTROL), shift: held(VK_SHIFT), alt: held(VK_MENU) }
    }

    /// Low-level keyboard hook procedure.
    ///
    /// Called by Windows on every keyboard event system-wide.  Only key-downs
    /// with `nCode >= 0` are forwarded to the active keymap.
    unsafe extern "system" fn keyboard_proc(
        n_code: i32,
        w_param: WPARAM,
        l_param: LPARAM,
    ) -> LRESULT {
        let message = w_param.0 as u32;
        if n_code >= 0 && (message == WM_KEYDOWN || message == WM_SYSKEYDOWN) {
            let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
            let keymap = ACTIVE.read().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(keymap) = keymap {
                if keymap.on_key_down(kb.vkCode, current_modifiers()) {
                    // Swallow the key so a captured binding does not reach the game.
                    return LRESULT(1);
                }
            }
        }
        CallNextHookEx(None, n_code, w_param, l_param)
    }

    /// Spawns the message-pump thread and waits for it to report its ID.
    pub fn spawn_pump() -> Option<(JoinHandle<()>, u32)> {
        let (id_tx, id_rx) = std_mpsc::sync_channel::<u32>(1);
        let thread = match std::thread::Builder::new()
            .name("hotkey-pump".into())
            .spawn(move || run_message_pump(id_tx))
        {
            Ok(t) => t,
            Err(e) => {
                warn!("[hotkey] Failed to spawn hook thread: {e}");
                return None;
            }
        };
        match id_rx.recv() {
            Ok(id) => Some((thread, id)),
            Err(_) => {
                warn!("[hotkey] Hook thread did not send its ID");
                let _ = thread.join();
                None
            }
        }
    }

    /// Installs `WH_KEYBOARD_LL`, runs a Windows message pump until `WM_QUIT`,
    /// then uninstalls the hook.
    ///
    /// Sends the current thread ID to `id_tx` before entering the pump so
    /// that [`super::HotkeyChannel::stop`] can later use it to post `WM_QUIT`.
    fn run_message_pump(id_tx: std_mpsc::SyncSender<u32>) {
        unsafe {
            let _ = id_tx.send(GetCurrentThreadId());
            drop(id_tx);

            let hook = match SetWindowsHookExW(
                WH_KEYBOARD_LL,
                Some(keyboard_proc),
                HINSTANCE::default(),
                0,
            ) {
                Ok(hook) => hook,
                Err(e) => {
                    error!("[hotkey] SetWindowsHookExW failed: {e}");
                    return;
                }
            };

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                DispatchMessageW(&msg);
            }

            let _ = UnhookWindowsHookEx(hook);
            debug!("[hotkey] Hook thread exited");
        }
    }

    /// Posts `WM_QUIT` to `thread_id`, causing its `GetMessageW` loop to exit.
    pub fn post_quit(thread_id: u32) {
        unsafe {
            let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
