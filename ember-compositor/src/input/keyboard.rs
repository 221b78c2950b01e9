// SPDX-License-Identifier: MPL-2.0-only

//! XKB keyboard state tracking.

use bitflags::bitflags;
use xkbcommon::xkb;

use super::{KeyState, SeatError};
use ember_compositor_config::XkbConfig;

/// Offset between evdev key codes and XKB keycodes.
const EVDEV_OFFSET: u32 = 8;

const MOD_INVALID: xkb::ModIndex = u32::MAX;

bitflags! {
    /// Modifier mask used for key-binding matching.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u32 {
        const CTRL = 1 << 0;
        const ALT = 1 << 1;
        const SUPER = 1 << 2;
        const SHIFT = 1 << 3;
    }
}

struct ModIndices {
    ctrl: xkb::ModIndex,
    alt: xkb::ModIndex,
    logo: xkb::ModIndex,
    shift: xkb::ModIndex,
}

/// Keyboard half of the seat: the XKB state machine plus the modifier index
/// table used to translate XKB masks into [`Modifiers`].
pub struct Keyboard {
    keymap: xkb::Keymap,
    state: xkb::State,
    indices: ModIndices,
}

fn keycode(key: u32) -> xkb::Keycode {
    xkb::Keycode::new(key + EVDEV_OFFSET)
}

impl Keyboard {
    pub fn new(config: &XkbConfig) -> Result<Self, SeatError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            &config.rules,
            &config.model,
            &config.layout,
            &config.variant,
            if config.options.is_empty() {
                None
            } else {
                Some(config.options.clone())
            },
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or(SeatError::Keymap)?;
        let state = xkb::State::new(&keymap);

        let indices = ModIndices {
            ctrl: keymap.mod_get_index(xkb::MOD_NAME_CTRL),
            alt: keymap.mod_get_index(xkb::MOD_NAME_ALT),
            logo: keymap.mod_get_index(xkb::MOD_NAME_LOGO),
            shift: keymap.mod_get_index(xkb::MOD_NAME_SHIFT),
        };

        Ok(Self {
            keymap,
            state,
            indices,
        })
    }

    pub fn keymap(&self) -> &xkb::Keymap {
        &self.keymap
    }

    /// Feed a key state change into the XKB state machine.
    pub fn update_key(&mut self, key: u32, state: KeyState) {
        let direction = match state {
            KeyState::Pressed => xkb::KeyDirection::Down,
            KeyState::Released => xkb::KeyDirection::Up,
        };
        self.state.update_key(keycode(key), direction);
    }

    pub fn keysym(&mut self, key: u32) -> xkb::Keysym {
        self.state.key_get_one_sym(keycode(key))
    }

    /// The effective modifier mask with the modifiers consumed by `key`
    /// removed, so that e.g. Shift does not block a Ctrl binding when it was
    /// needed to produce the keysym itself.
    pub fn binding_modifiers(&mut self, key: u32) -> Modifiers {
        let code = keycode(key);
        let mask = self.state.serialize_mods(xkb::STATE_MODS_EFFECTIVE);

        let mut modifiers = Modifiers::empty();
        for (index, flag) in [
            (self.indices.ctrl, Modifiers::CTRL),
            (self.indices.alt, Modifiers::ALT),
            (self.indices.logo, Modifiers::SUPER),
            (self.indices.shift, Modifiers::SHIFT),
        ] {
            if index == MOD_INVALID || mask & (1 << index) == 0 {
                continue;
            }
            if self.state.mod_index_is_consumed(code, index) {
                continue;
            }
            modifiers |= flag;
        }
        modifiers
    }
}
