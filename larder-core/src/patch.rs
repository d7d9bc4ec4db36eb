//! Three-way field patches for registry merges.
//!
//! Registry mutations distinguish *leave the field alone* from *clear the
//! field* from *overwrite the field*. A plain `Option<T>` cannot express all
//! three, so patch structs use [`Patch<T>`] per field. When deserialized from
//! JSON, a missing field maps to [`Patch::Keep`] (via `#[serde(default)]`)
//! and an explicit `null` maps to [`Patch::Clear`].

use serde::{Deserialize, Deserializer};

/// A single-field merge instruction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Patch<T> {
    /// Leave the current value untouched.
    #[default]
    Keep,
    /// Reset the field to its absent/default state.
    Clear,
    /// Overwrite the field with the given value.
    Set(T),
}

impl<T> Patch<T> {
    /// Returns `true` for [`Patch::Keep`].
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    /// Builds a patch from an option: `Some` sets, `None` clears.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Patch::Set(value),
            None => Patch::Clear,
        }
    }
}

impl<T: PartialEq> Patch<T> {
    /// Merges this patch into an optional slot.
    ///
    /// Returns `true` when the slot changed.
    pub fn apply(self, slot: &mut Option<T>) -> bool {
        match self {
            Patch::Keep => false,
            Patch::Clear => slot.take().is_some(),
            Patch::Set(value) => {
                if slot.as_ref() == Some(&value) {
                    false
                } else {
                    *slot = Some(value);
                    true
                }
            }
        }
    }
}

impl<T: PartialEq + Default> Patch<T> {
    /// Merges this patch into a non-optional slot; `Clear` restores the
    /// default value.
    ///
    /// Returns `true` when the slot changed.
    pub fn apply_value(self, slot: &mut T) -> bool {
        match self {
            Patch::Keep => false,
            Patch::Clear => {
                let default = T::default();
                if *slot == default {
                    false
                } else {
                    *slot = default;
                    true
                }
            }
            Patch::Set(value) => {
                if *slot == value {
                    false
                } else {
                    *slot = value;
                    true
                }
            }
        }
    }
}

impl<T> From<T> for Patch<T> {
    fn from(value: T) -> Self {
        Patch::Set(value)
    }
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Patch::Set(value),
            None => Patch::Clear,
        })
    }
}
