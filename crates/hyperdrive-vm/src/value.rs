// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Word-sized tagged values.
//!
//! Every value fits in one machine word so that compiled code can move it
//! through registers and memory blocks without boxing:
//!
//! ```text
//! ...xxxx1  fixnum        (n << 1) | 1
//! 00000000  false
//! 00000010  true
//! 00000100  nil
//! 00000110  undef
//! ..xx1110  symbol        (id << 8) | 0x0e
//! ...xx000  heap object   (index + 1) << 3
//! ```

use std::fmt;

use crate::symbol::SymbolId;

/// A reference to an object in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    /// Creates a reference from a heap slot index.
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Returns the heap slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A tagged value word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// `false`
    pub const FALSE: Value = Value(0);
    /// `true`
    pub const TRUE: Value = Value(2);
    /// `nil`
    pub const NIL: Value = Value(4);
    /// Internal "no value" marker, never visible to programs.
    pub const UNDEF: Value = Value(6);

    /// Largest integer representable as a fixnum.
    pub const FIXNUM_MAX: i64 = i64::MAX >> 1;
    /// Smallest integer representable as a fixnum.
    pub const FIXNUM_MIN: i64 = i64::MIN >> 1;

    const SYMBOL_FLAG: u64 = 0x0e;
    const SYMBOL_MASK: u64 = 0xff;

    /// Reinterprets a raw word as a value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Value(raw)
    }

    /// Returns the raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encodes `n` as a fixnum if it fits.
    #[inline]
    pub fn fixnum(n: i64) -> Option<Self> {
        if (Self::FIXNUM_MIN..=Self::FIXNUM_MAX).contains(&n) {
            Some(Value(((n as u64) << 1) | 1))
        } else {
            None
        }
    }

    /// Returns whether this is a tagged integer.
    #[inline]
    pub fn is_fixnum(self) -> bool {
        self.0 & 1 == 1
    }

    /// Decodes a fixnum.
    #[inline]
    pub fn as_fixnum(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// Encodes a symbol.
    #[inline]
    pub fn symbol(id: SymbolId) -> Self {
        Value(((id.index() as u64) << 8) | Self::SYMBOL_FLAG)
    }

    /// Returns whether this is a symbol.
    #[inline]
    pub fn is_symbol(self) -> bool {
        self.0 & Self::SYMBOL_MASK == Self::SYMBOL_FLAG
    }

    /// Decodes a symbol.
    #[inline]
    pub fn as_symbol(self) -> Option<SymbolId> {
        if self.is_symbol() {
            Some(SymbolId::new((self.0 >> 8) as usize))
        } else {
            None
        }
    }

    /// Encodes a heap reference.
    #[inline]
    pub fn object(obj: ObjRef) -> Self {
        Value(((obj.index() as u64) + 1) << 3)
    }

    /// Decodes a heap reference. Returns `None` for immediates.
    #[inline]
    pub fn as_object(self) -> Option<ObjRef> {
        if self.0 != 0 && self.0 & 0b111 == 0 {
            Some(ObjRef::new(((self.0 >> 3) - 1) as usize))
        } else {
            None
        }
    }

    /// Converts a boolean.
    #[inline]
    pub fn from_bool(b: bool) -> Self {
        if b { Value::TRUE } else { Value::FALSE }
    }

    /// Ruby truthiness: everything except `false` and `nil`.
    #[inline]
    pub fn truthy(self) -> bool {
        self.0 & !Value::NIL.0 != 0
    }

    /// Returns whether this is `nil`.
    #[inline]
    pub fn is_nil(self) -> bool {
        self == Value::NIL
    }

    /// Returns whether this is the undef marker.
    #[inline]
    pub fn is_undef(self) -> bool {
        self == Value::UNDEF
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::FALSE => write!(f, "false"),
            Value::TRUE => write!(f, "true"),
            Value::NIL => write!(f, "nil"),
            Value::UNDEF => write!(f, "undef"),
            v if v.is_fixnum() => write!(f, "{}", v.as_fixnum().unwrap_or_default()),
            v => match (v.as_symbol(), v.as_object()) {
                (Some(sym), _) => write!(f, ":#{}", sym.index()),
                (_, Some(obj)) => write!(f, "#<obj {}>", obj.index()),
                _ => write!(f, "#<raw {:#x}>", v.0),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::from_bool(b)
    }
}
