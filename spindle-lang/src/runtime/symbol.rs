//! Types for "symbols", a cheaply cloned string type used for every name the
//! virtual machine handles: machine names, state names, variable names, and
//! native function names.

use std::borrow::Borrow;
use std::fmt::{Debug, Display};
use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use std::{array, iter};

use serde::de::Visitor;
use serde::{Deserialize, Serialize};

/// A reference-counted, immutable string.
///
/// Cloning a symbol never copies the underlying string data.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Symbol(Arc<str>);

impl Symbol {
    /// Returns this symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an iterator over the `.`-separated segments of this symbol.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split('.')
    }

    /// Returns true if this symbol is a qualified name containing at least
    /// one `.`.
    #[must_use]
    pub fn is_qualified(&self) -> bool {
        self.0.contains('.')
    }
}

macro_rules! static_symbols {
    ($($name:ident => $string:literal),+ $(,)?) => {
        impl Symbol {
            $(
                #[doc = concat!("Returns the symbol for \"", $string, "\".")]
                pub fn $name() -> &'static Self {
                    static S: OnceLock<Symbol> = OnceLock::new();
                    S.get_or_init(|| Symbol::from($string))
                }
            )+
        }
    };
}

static_symbols!(
    empty => "",
    main_symbol => "main",
    time_symbol => "time",
    pointer_symbol => "pointer",
    io_symbol => "io",
    math_symbol => "math",
    len_symbol => "len",
    get_symbol => "get",
    push_symbol => "push",
    down_symbol => "down",
    up_symbol => "up",
    move_symbol => "move",
    drag_symbol => "drag",
);

macro_rules! impl_froms {
    ($type:ty) => {
        impl From<String> for $type {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl From<&'_ $type> for $type {
            fn from(value: &'_ $type) -> Self {
                value.clone()
            }
        }

        impl From<&'_ String> for $type {
            fn from(value: &'_ String) -> Self {
                Self(Arc::from(value.as_str()))
            }
        }

        impl From<&'_ str> for $type {
            fn from(value: &'_ str) -> Self {
                Self(Arc::from(value))
            }
        }
    };
}

impl_froms!(Symbol);

impl PartialEq<&'_ str> for Symbol {
    fn eq(&self, other: &&'_ str) -> bool {
        &*self.0 == *other
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(SymbolVisitor)
    }
}

struct SymbolVisitor;

impl Visitor<'_> for SymbolVisitor {
    type Value = Symbol;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a symbol")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(Symbol::from(v))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(Symbol::from(v))
    }
}

/// A type that contains a list of symbols.
///
/// Used when registering a native function under several names at once.
pub trait SymbolList {
    /// The iterator used for [`into_symbols`](Self::into_symbols).
    type Iterator: Iterator<Item = Symbol>;

    /// Returns `self` as an iterator over its contained symbols.
    fn into_symbols(self) -> Self::Iterator;
}

/// An iterator over an array of types that implement [`Into<Symbol>`].
pub struct ArraySymbolsIntoIter<T: Into<Symbol>, const N: usize>(array::IntoIter<T, N>);

impl<T: Into<Symbol>, const N: usize> Iterator for ArraySymbolsIntoIter<T, N> {
    type Item = Symbol;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(T::into)
    }
}

impl<T: Into<Symbol>, const N: usize> SymbolList for [T; N] {
    type Iterator = ArraySymbolsIntoIter<T, N>;

    fn into_symbols(self) -> Self::Iterator {
        ArraySymbolsIntoIter(self.into_iter())
    }
}

impl SymbolList for Symbol {
    type Iterator = iter::Once<Symbol>;

    fn into_symbols(self) -> Self::Iterator {
        iter::once(self)
    }
}

impl SymbolList for &'_ Symbol {
    type Iterator = iter::Once<Symbol>;

    fn into_symbols(self) -> Self::Iterator {
        self.clone().into_symbols()
    }
}

impl SymbolList for &'_ str {
    type Iterator = iter::Once<Symbol>;

    fn into_symbols(self) -> Self::Iterator {
        Symbol::from(self).into_symbols()
    }
}
