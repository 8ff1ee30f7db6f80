//! Bit flags reported to and accepted from callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($bit);)*

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $(if self.contains(Self::$flag) && Self::$flag.0 != 0 {
                    names.push(stringify!($flag));
                })*
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// Per-frame information delivered with every result.
    InfoFlags {
        /// The result was delivered after `submit_frame` returned, or from
        /// another thread.
        ASYNCHRONOUS = 1 << 0,
        /// The codec dropped the frame. A soft failure.
        FRAME_DROPPED = 1 << 1,
        /// The caller holds the only handle to the output buffer.
        BUFFER_MODIFIABLE = 1 << 2,
    }
}

flag_set! {
    /// Options for `begin_pass`.
    PassFlags {
        /// This is the last pass; the codec must not ask for another.
        FINAL = 1 << 0,
    }
}

flag_set! {
    /// Decompression behaviour requested by the caller.
    DecodeFlags {
        /// Allow the decoder to finish frames after `submit_frame` returns.
        ENABLE_ASYNCHRONOUS_DECOMPRESSION = 1 << 0,
        /// Deliver frames in display order rather than decode order.
        ENABLE_TEMPORAL_PROCESSING = 1 << 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let flags = InfoFlags::ASYNCHRONOUS | InfoFlags::FRAME_DROPPED;
        assert!(flags.contains(InfoFlags::ASYNCHRONOUS));
        assert!(flags.contains(InfoFlags::FRAME_DROPPED));
        assert!(!flags.contains(InfoFlags::BUFFER_MODIFIABLE));
        assert!(InfoFlags::default().is_empty());
    }

    #[test]
    fn debug_lists_names() {
        let mut flags = DecodeFlags::NONE;
        flags.insert(DecodeFlags::ENABLE_TEMPORAL_PROCESSING);
        assert_eq!(
            format!("{flags:?}"),
            "DecodeFlags(ENABLE_TEMPORAL_PROCESSING)"
        );
        assert_eq!(format!("{:?}", PassFlags::NONE), "PassFlags()");
    }
}
