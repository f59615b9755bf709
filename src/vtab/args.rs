use core::ffi::{c_char, CStr};
use std::borrow::Cow;

use crate::error::{Error, ErrorCode, Result};

/// Arguments the engine passes to xCreate/xConnect.
///
/// For `CREATE VIRTUAL TABLE main.t USING m(a, b=1)` this is module `m`,
/// database `main`, table `t` and arguments `["a", "b=1"]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleArgs {
    pub module_name: String,
    pub database_name: String,
    pub table_name: String,
    pub arguments: Vec<String>,
}

impl ModuleArgs {
    /// Build from already-decoded strings in engine `argv` order.
    pub fn from_strings<S: AsRef<str>>(argv: &[S]) -> Result<Self> {
        if argv.len() < 3 {
            return Err(Error::internal(format!(
                "virtual table constructor received {} arguments, expected at least 3",
                argv.len()
            )));
        }
        Ok(Self {
            module_name: argv[0].as_ref().to_owned(),
            database_name: argv[1].as_ref().to_owned(),
            table_name: argv[2].as_ref().to_owned(),
            arguments: argv[3..].iter().map(|a| a.as_ref().to_owned()).collect(),
        })
    }

    /// # Safety
    /// `argv` must hold `argc` NUL-terminated strings.
    pub(crate) unsafe fn from_raw(argc: i32, argv: *const *const c_char) -> Result<Self> {
        let argc = argc.max(0) as usize;
        if argv.is_null() {
            return Self::from_strings::<&str>(&[]);
        }
        let raw = unsafe { core::slice::from_raw_parts(argv, argc) };
        let mut decoded = Vec::with_capacity(argc);
        for (i, ptr) in raw.iter().enumerate() {
            if ptr.is_null() {
                decoded.push(String::new());
                continue;
            }
            let text = unsafe { CStr::from_ptr(*ptr) }.to_str().map_err(|_| {
                Error::with_message(
                    ErrorCode::Error,
                    format!("module argument {} is not valid UTF-8", i),
                )
            })?;
            decoded.push(text.to_owned());
        }
        Self::from_strings(&decoded)
    }

    /// `key=value` pairs among the declaration arguments, values dequoted.
    pub fn parameters(&self) -> Result<Vec<(&str, Cow<'_, str>)>> {
        self.arguments.iter().map(|a| parameter(a)).collect()
    }
}

/// Strip one level of SQL quoting (`'..'`, `".."`, `[..]` or `` `..` ``),
/// collapsing doubled inner quotes.
pub fn dequote(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return Cow::Borrowed(s);
    }
    let (open, close) = (bytes[0], bytes[bytes.len() - 1]);
    let quote = match (open, close) {
        (b'\'', b'\'') | (b'"', b'"') | (b'`', b'`') => open as char,
        (b'[', b']') => return Cow::Borrowed(&s[1..s.len() - 1]),
        _ => return Cow::Borrowed(s),
    };
    let inner = &s[1..s.len() - 1];
    let doubled = [quote, quote].iter().collect::<String>();
    if inner.contains(&doubled) {
        Cow::Owned(inner.replace(&doubled, &quote.to_string()))
    } else {
        Cow::Borrowed(inner)
    }
}

/// Split a `key=value` module argument.
pub fn parameter(arg: &str) -> Result<(&str, Cow<'_, str>)> {
    let arg = arg.trim();
    match arg.split_once('=') {
        Some((key, value)) => Ok((key.trim(), dequote(value.trim()))),
        None => Err(Error::with_message(
            ErrorCode::Error,
            format!("illegal argument: '{}'", arg),
        )),
    }
}

/// Quote-safe identifier for composing a `CREATE TABLE` declaration.
pub fn escape_double_quote(identifier: &str) -> Cow<'_, str> {
    if identifier.contains('"') {
        Cow::Owned(identifier.replace('"', "\"\""))
    } else {
        Cow::Borrowed(identifier)
    }
}
