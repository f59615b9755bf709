use std::borrow::Cow;
use std::cell::OnceCell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::provider::{RawBytes, Sqlite3Api, ValueType};

/// Owned SQLite value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Arbitrary bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Return the SQLite value type tag for this owned value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    /// Borrow the integer payload when this is `Value::Integer`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the float payload when this is `Value::Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the text payload when this is `Value::Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Borrow the blob payload when this is `Value::Blob`.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Integer view with SQLite-style conversion (text is parsed, NULL is 0).
    pub fn to_i64(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Text(v) => parse_leading_i64(v),
            Value::Blob(v) => parse_leading_i64(&String::from_utf8_lossy(v)),
        }
    }

    /// Floating view with SQLite-style conversion.
    pub fn to_f64(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Integer(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Text(v) => v.trim().parse().unwrap_or(0.0),
            Value::Blob(v) => String::from_utf8_lossy(v).trim().parse().unwrap_or(0.0),
        }
    }

    /// Text view; `None` for NULL.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(Cow::Owned(v.to_string())),
            Value::Float(v) => Some(Cow::Owned(v.to_string())),
            Value::Text(v) => Some(Cow::Borrowed(v.as_str())),
            Value::Blob(v) => Some(String::from_utf8_lossy(v)),
        }
    }

    /// Byte view; empty for NULL.
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Value::Null => Cow::Borrowed(&[]),
            Value::Integer(v) => Cow::Owned(v.to_string().into_bytes()),
            Value::Float(v) => Cow::Owned(v.to_string().into_bytes()),
            Value::Text(v) => Cow::Borrowed(v.as_bytes()),
            Value::Blob(v) => Cow::Borrowed(v.as_slice()),
        }
    }
}

fn parse_leading_i64(text: &str) -> i64 {
    let text = text.trim_start();
    let end = text
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    text[..end].parse().unwrap_or(0)
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

/// Borrowed SQLite value view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueRef<'a> {
    /// SQL NULL.
    Null,
    /// Borrowed 64-bit integer.
    Integer(i64),
    /// Borrowed 64-bit floating point.
    Float(f64),
    /// Borrowed UTF-8 text.
    Text(&'a str),
    /// Borrowed bytes.
    Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    /// Return the SQLite value type tag for this borrowed value.
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueRef::Null => ValueType::Null,
            ValueRef::Integer(_) => ValueType::Integer,
            ValueRef::Float(_) => ValueType::Float,
            ValueRef::Text(_) => ValueType::Text,
            ValueRef::Blob(_) => ValueType::Blob,
        }
    }

    /// Borrow the integer payload when this is `ValueRef::Integer`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ValueRef::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the float payload when this is `ValueRef::Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueRef::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the text payload when this is `ValueRef::Text`.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            ValueRef::Text(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the blob payload when this is `ValueRef::Blob`.
    pub fn as_blob(&self) -> Option<&'a [u8]> {
        match self {
            ValueRef::Blob(v) => Some(*v),
            _ => None,
        }
    }

    /// Copy this borrowed value into an owned [`Value`].
    pub fn to_owned(&self) -> Value {
        match self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(*v),
            ValueRef::Float(v) => Value::Float(*v),
            ValueRef::Text(v) => Value::Text((*v).to_owned()),
            ValueRef::Blob(v) => Value::Blob((*v).to_vec()),
        }
    }

    /// # Safety
    /// Caller must ensure `raw` points to valid bytes for the duration of `'a`.
    ///
    /// If `raw` is valid UTF-8 this returns `ValueRef::Text`; otherwise it
    /// falls back to `ValueRef::Blob` to avoid unchecked UTF-8 assumptions.
    pub unsafe fn from_raw_text(raw: RawBytes) -> ValueRef<'a> {
        match unsafe { raw.as_str() } {
            Some(text) => ValueRef::Text(text),
            None => ValueRef::Blob(unsafe { raw.as_slice() }),
        }
    }

    /// # Safety
    /// Caller must ensure `raw` points to valid bytes for the duration of `'a`.
    pub unsafe fn from_raw_blob(raw: RawBytes) -> ValueRef<'a> {
        ValueRef::Blob(unsafe { raw.as_slice() })
    }
}

/// Engine-owned argument value handed to a virtual table callback.
///
/// The native pointer is only valid during the callback that supplied it;
/// the `'a` lifetime keeps the wrapper from escaping that call. Use
/// [`SqlValue::persist`] to keep the value: once persisted, every accessor
/// serves the snapshot and the native pointer is never read again.
pub struct SqlValue<'a, P: Sqlite3Api> {
    api: &'a P,
    raw: Option<NonNull<P::Value>>,
    snapshot: OnceCell<Value>,
    _call: PhantomData<&'a P::Value>,
}

impl<'a, P: Sqlite3Api> SqlValue<'a, P> {
    /// Wrap a value pointer; null reads as SQL NULL.
    ///
    /// # Safety
    /// `raw` must be null or a live `sqlite3_value` for all of `'a`.
    pub unsafe fn from_raw(api: &'a P, raw: *mut P::Value) -> Self {
        let raw = NonNull::new(raw);
        let snapshot = OnceCell::new();
        if raw.is_none() {
            let _ = snapshot.set(Value::Null);
        }
        Self {
            api,
            raw,
            snapshot,
            _call: PhantomData,
        }
    }

    fn native(&self) -> Option<NonNull<P::Value>> {
        if self.snapshot.get().is_some() {
            return None;
        }
        self.raw
    }

    pub fn is_persisted(&self) -> bool {
        self.snapshot.get().is_some()
    }

    /// Storage class as seen when the value was read.
    pub fn value_type(&self) -> ValueType {
        match (self.native(), self.snapshot.get()) {
            (Some(raw), _) => unsafe { self.api.value_type(raw) },
            (None, Some(value)) => value.value_type(),
            (None, None) => ValueType::Null,
        }
    }

    pub fn get_int(&self) -> i32 {
        self.get_int64() as i32
    }

    pub fn get_int64(&self) -> i64 {
        match (self.native(), self.snapshot.get()) {
            (Some(raw), _) => unsafe { self.api.value_int64(raw) },
            (None, Some(value)) => value.to_i64(),
            (None, None) => 0,
        }
    }

    pub fn get_double(&self) -> f64 {
        match (self.native(), self.snapshot.get()) {
            (Some(raw), _) => unsafe { self.api.value_double(raw) },
            (None, Some(value)) => value.to_f64(),
            (None, None) => 0.0,
        }
    }

    /// Text form; `None` for NULL. Invalid UTF-8 is replaced lossily.
    pub fn get_string(&self) -> Option<Cow<'_, str>> {
        match (self.native(), self.snapshot.get()) {
            (Some(raw), _) => {
                if unsafe { self.api.value_type(raw) } == ValueType::Null {
                    return None;
                }
                let bytes = unsafe { self.api.value_text(raw).as_slice() };
                Some(String::from_utf8_lossy(bytes))
            }
            (None, Some(value)) => value.to_text(),
            (None, None) => None,
        }
    }

    /// Byte form; empty for NULL.
    pub fn get_blob(&self) -> Cow<'_, [u8]> {
        match (self.native(), self.snapshot.get()) {
            (Some(raw), _) => Cow::Borrowed(unsafe { self.api.value_blob(raw).as_slice() }),
            (None, Some(value)) => value.to_bytes(),
            (None, None) => Cow::Borrowed(&[]),
        }
    }

    /// Length in bytes of the text or blob form.
    pub fn bytes(&self) -> usize {
        match (self.native(), self.snapshot.get()) {
            (Some(raw), _) => unsafe { self.api.value_bytes(raw) },
            (None, Some(value)) => value.to_bytes().len(),
            (None, None) => 0,
        }
    }

    /// Snapshot the value with its current type and return an owned copy.
    pub fn persist(&self) -> Value {
        self.snapshot
            .get_or_init(|| match self.raw {
                Some(raw) => unsafe { read_native(self.api, raw) },
                None => Value::Null,
            })
            .clone()
    }
}

impl<P: Sqlite3Api> core::fmt::Debug for SqlValue<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SqlValue")
            .field("value_type", &self.value_type())
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

unsafe fn read_native<P: Sqlite3Api>(api: &P, raw: NonNull<P::Value>) -> Value {
    match unsafe { api.value_type(raw) } {
        ValueType::Null => Value::Null,
        ValueType::Integer => Value::Integer(unsafe { api.value_int64(raw) }),
        ValueType::Float => Value::Float(unsafe { api.value_double(raw) }),
        ValueType::Text => unsafe { ValueRef::from_raw_text(api.value_text(raw)) }.to_owned(),
        ValueType::Blob => Value::Blob(unsafe { api.value_blob(raw).as_slice() }.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use crate::provider::{ApiVersion, RawBytes, ValueType};
    use crate::vtab::mock::{MockEngine, MockValue};

    use super::{SqlValue, Value, ValueRef};

    #[test]
    fn value_ref_to_owned() {
        let value = ValueRef::Text("hello");
        assert_eq!(value.to_owned(), Value::Text("hello".to_owned()));
    }

    #[test]
    fn value_ref_from_raw_text_falls_back_to_blob_when_invalid_utf8() {
        let bytes = [0xff_u8, 0xfe_u8];
        let raw = RawBytes {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        };
        let value = unsafe { ValueRef::from_raw_text(raw) };
        assert_eq!(value, ValueRef::Blob(&bytes));
    }

    #[test]
    fn owned_value_coercions() {
        assert_eq!(Value::Text(" 42abc".into()).to_i64(), 42);
        assert_eq!(Value::Text("-7".into()).to_i64(), -7);
        assert_eq!(Value::Float(2.9).to_i64(), 2);
        assert_eq!(Value::Integer(3).to_f64(), 3.0);
        assert_eq!(Value::Null.to_text(), None);
        assert_eq!(Value::Integer(12).to_bytes().len(), 2);
    }

    #[test]
    fn sql_value_reads_through_engine() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut raw = MockValue::Text("hello".to_owned());
        let value = unsafe { SqlValue::from_raw(api, &mut raw) };
        assert_eq!(value.value_type(), ValueType::Text);
        assert_eq!(value.get_string().as_deref(), Some("hello"));
        assert_eq!(value.bytes(), 5);
        assert!(!value.is_persisted());
    }

    #[test]
    fn persisted_value_never_touches_native_memory_again() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut raw = MockValue::Integer(17);
        let value = unsafe { SqlValue::from_raw(api, &mut raw) };
        assert_eq!(value.persist(), Value::Integer(17));
        // Simulate the engine reusing the slot after the call returned.
        raw = MockValue::Text("clobbered".to_owned());
        assert_eq!(raw, MockValue::Text("clobbered".to_owned()));
        assert!(value.is_persisted());
        assert_eq!(value.value_type(), ValueType::Integer);
        assert_eq!(value.get_int64(), 17);
        assert_eq!(value.get_int(), 17);
        assert_eq!(value.get_double(), 17.0);
        assert_eq!(value.get_string().as_deref(), Some("17"));
        assert_eq!(value.persist(), Value::Integer(17));
    }

    #[test]
    fn null_pointer_reads_as_null() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let value: SqlValue<'_, MockEngine> = unsafe { SqlValue::from_raw(api, core::ptr::null_mut()) };
        assert_eq!(value.value_type(), ValueType::Null);
        assert_eq!(value.get_string(), None);
        assert!(value.get_blob().is_empty());
        assert_eq!(value.persist(), Value::Null);
    }
}
