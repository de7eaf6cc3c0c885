//! Parameter buffers bound to a statement and read back after execution.

use crate::cli::{succeeded, Cli, RawHandle, SqlReturn};
use crate::error::{OdbcError, Result};
use crate::protocol::types::{sql_type, CType};
use crate::protocol::ParamValue;
use serde_json::Value;
use std::marker::PhantomData;

/// `SQL_NULL_DATA` length indicator.
pub const NULL_DATA: isize = -1;

/// ODBC parameter direction code. Even codes carry an output component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamDirection(pub i16);

impl ParamDirection {
    pub const INPUT: ParamDirection = ParamDirection(1);
    pub const INPUT_OUTPUT: ParamDirection = ParamDirection(2);
    pub const OUTPUT: ParamDirection = ParamDirection(4);

    pub fn has_output(self) -> bool {
        self.0 % 2 == 0
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "IN" | "INPUT" => Some(ParamDirection::INPUT),
            "INOUT" | "INPUT_OUTPUT" => Some(ParamDirection::INPUT_OUTPUT),
            "OUT" | "OUTPUT" => Some(ParamDirection::OUTPUT),
            _ => None,
        }
    }
}

impl Default for ParamDirection {
    fn default() -> Self {
        ParamDirection::INPUT
    }
}

/// A parameter as described by the caller, before any buffer exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: ParamValue,
    pub direction: ParamDirection,
    pub sql_type: Option<i16>,
    pub length: Option<usize>,
    pub decimal_digits: Option<i16>,
}

impl Param {
    pub fn input(value: impl Into<ParamValue>) -> Self {
        Self {
            value: value.into(),
            direction: ParamDirection::INPUT,
            sql_type: None,
            length: None,
            decimal_digits: None,
        }
    }

    pub fn output(sql_type: i16) -> Self {
        Self {
            value: ParamValue::Null,
            direction: ParamDirection::OUTPUT,
            sql_type: Some(sql_type),
            length: None,
            decimal_digits: None,
        }
    }

    pub fn input_output(value: impl Into<ParamValue>, sql_type: i16) -> Self {
        Self {
            value: value.into(),
            direction: ParamDirection::INPUT_OUTPUT,
            sql_type: Some(sql_type),
            length: None,
            decimal_digits: None,
        }
    }

    pub fn with_direction(mut self, direction: ParamDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    /// Parses a host parameter: either a bare scalar (input) or an object
    /// `{ "ParamType", "DataType", "Data", "Length" }`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Ok(Param::input(ParamValue::from_json(value)?));
        };

        let direction = match map.get("ParamType") {
            None | Some(Value::Null) => ParamDirection::INPUT,
            Some(Value::String(name)) => ParamDirection::from_name(name).ok_or_else(|| {
                OdbcError::Usage(format!("Unknown ParamType: {}", name))
            })?,
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|code| i16::try_from(code).ok())
                .map(ParamDirection)
                .ok_or_else(|| OdbcError::Usage(format!("Invalid ParamType: {}", n)))?,
            Some(other) => {
                return Err(OdbcError::Usage(format!("Invalid ParamType: {}", other)));
            }
        };

        let sql_type = match map.get("DataType") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_i64()
                    .and_then(|code| i16::try_from(code).ok())
                    .ok_or_else(|| OdbcError::Usage(format!("Invalid DataType: {}", v)))?,
            ),
        };

        let length = match map.get("Length") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| OdbcError::Usage(format!("Invalid Length: {}", v)))?,
            ),
        };

        let value = match map.get("Data") {
            None => ParamValue::Null,
            Some(v) => ParamValue::from_json(v)?,
        };

        Ok(Param {
            value,
            direction,
            sql_type,
            length,
            decimal_digits: None,
        })
    }
}

/// Heap storage for a parameter value, 8-byte aligned so fixed-width
/// values can be written by the driver in place.
struct ParamBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ParamBuffer {
    fn with_capacity(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8).max(1)],
            len,
        }
    }

    fn from_bytes(bytes: &[u8], capacity: usize) -> Self {
        let mut buf = Self::with_capacity(capacity.max(bytes.len()));
        buf.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    fn as_bytes(&self) -> &[u8] {
        // Safety: `words` holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, with unique access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }
}

/// One parameter with its value buffer and length indicator.
pub struct Parameter {
    direction: ParamDirection,
    c_type: CType,
    sql_type: i16,
    column_size: usize,
    decimal_digits: i16,
    buffer: ParamBuffer,
    indicator: Box<isize>,
}

impl Parameter {
    /// Allocates the buffers for `param`. Output-capable character and
    /// binary parameters without a `length` get `default_output_len` bytes.
    pub fn new(param: &Param, default_output_len: usize) -> Result<Self> {
        let output = param.direction.has_output();
        let room = |data_len: usize| {
            if output {
                data_len.max(param.length.unwrap_or(default_output_len))
            } else {
                data_len
            }
        };

        let (c_type, default_sql, bytes, indicator): (CType, i16, Vec<u8>, isize) =
            match &param.value {
                ParamValue::Null => {
                    let c_type = param.sql_type.map(CType::for_sql_type).unwrap_or(CType::Char);
                    (c_type, sql_type::VARCHAR, Vec::new(), NULL_DATA)
                }
                ParamValue::Boolean(b) => (CType::Bit, sql_type::BIT, vec![*b as u8], 0),
                ParamValue::Integer(n) => (
                    CType::SBigInt,
                    sql_type::INTEGER,
                    i64::from(*n).to_ne_bytes().to_vec(),
                    0,
                ),
                ParamValue::BigInt(n) => {
                    (CType::SBigInt, sql_type::BIGINT, n.to_ne_bytes().to_vec(), 0)
                }
                ParamValue::Double(f) => {
                    (CType::Double, sql_type::DOUBLE, f.to_ne_bytes().to_vec(), 0)
                }
                ParamValue::String(s) => (
                    CType::Char,
                    sql_type::VARCHAR,
                    s.as_bytes().to_vec(),
                    s.len() as isize,
                ),
                ParamValue::Decimal(s) => (
                    CType::Char,
                    sql_type::DECIMAL,
                    s.as_bytes().to_vec(),
                    s.len() as isize,
                ),
                ParamValue::Binary(b) => {
                    (CType::Binary, sql_type::VARBINARY, b.clone(), b.len() as isize)
                }
            };

        let (capacity, column_size) = match c_type.fixed_width() {
            Some(width) => (width, param.length.unwrap_or(0)),
            None => {
                let data_room = room(bytes.len());
                // Character buffers keep room for the terminating NUL.
                let capacity = if c_type == CType::Char {
                    data_room + 1
                } else {
                    data_room
                };
                (capacity, data_room.max(1))
            }
        };

        let decimal_digits = param.decimal_digits.unwrap_or_else(|| match &param.value {
            ParamValue::Decimal(s) => s
                .split_once('.')
                .map(|(_, frac)| frac.len() as i16)
                .unwrap_or(0),
            _ => 0,
        });

        Ok(Self {
            direction: param.direction,
            c_type,
            sql_type: param.sql_type.unwrap_or(default_sql),
            column_size,
            decimal_digits,
            buffer: ParamBuffer::from_bytes(&bytes, capacity),
            indicator: Box::new(indicator),
        })
    }

    pub fn direction(&self) -> ParamDirection {
        self.direction
    }

    pub fn c_type(&self) -> CType {
        self.c_type
    }

    pub fn sql_type(&self) -> i16 {
        self.sql_type
    }

    pub fn has_output(&self) -> bool {
        self.direction.has_output()
    }

    /// Pointers into this parameter's buffers for `SQLBindParameter`.
    pub fn binding(&mut self, number: u16) -> ParameterBinding<'_> {
        ParameterBinding {
            number,
            direction: self.direction,
            c_type: self.c_type,
            sql_type: self.sql_type,
            column_size: self.column_size,
            decimal_digits: self.decimal_digits,
            buffer_len: self.buffer.len as isize,
            value_ptr: self.buffer.as_mut_ptr(),
            indicator_ptr: &mut *self.indicator as *mut isize,
            _buffers: PhantomData,
        }
    }

    fn data_len(&self) -> usize {
        let capacity = self.buffer.len;
        let limit = match self.c_type {
            CType::Char => capacity.saturating_sub(1),
            _ => capacity,
        };
        match *self.indicator {
            n if n >= 0 => (n as usize).min(limit),
            // SQL_NTS or SQL_NO_TOTAL: scan for the terminator.
            _ => self.buffer.as_bytes()[..limit]
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(limit),
        }
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("direction", &self.direction)
            .field("c_type", &self.c_type)
            .field("sql_type", &self.sql_type)
            .field("column_size", &self.column_size)
            .field("indicator", &*self.indicator)
            .finish()
    }
}

/// Everything the driver needs to bind one parameter. Borrowing the
/// parameter mutably keeps the buffers alive and unmoved while the
/// binding is in use.
pub struct ParameterBinding<'a> {
    pub number: u16,
    pub direction: ParamDirection,
    pub c_type: CType,
    pub sql_type: i16,
    pub column_size: usize,
    pub decimal_digits: i16,
    pub value_ptr: *mut u8,
    pub buffer_len: isize,
    pub indicator_ptr: *mut isize,
    _buffers: PhantomData<&'a mut Parameter>,
}

/// Binds `params` to ordinals 1..=n, stopping at the first failure and
/// returning its code. Earlier binds stay on the handle.
pub fn bind_parameters(cli: &dyn Cli, stmt: RawHandle, params: &mut [Parameter]) -> SqlReturn {
    for (index, param) in params.iter_mut().enumerate() {
        let number = (index + 1) as u16;
        let rc = cli.bind_parameter(stmt, &param.binding(number));
        if !succeeded(rc) {
            log::debug!("SQLBindParameter failed at ordinal {}: {:?}", number, rc);
            return rc;
        }
    }
    SqlReturn::SUCCESS
}

/// Decodes an output buffer according to the declared SQL type.
pub fn get_output_parameter(param: &Parameter) -> ParamValue {
    if *param.indicator == NULL_DATA {
        return ParamValue::Null;
    }
    let bytes = param.buffer.as_bytes();
    match param.c_type {
        CType::SBigInt => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            let n = i64::from_ne_bytes(raw);
            match param.sql_type {
                sql_type::INTEGER | sql_type::SMALLINT | sql_type::TINYINT => {
                    ParamValue::Integer(n as i32)
                }
                _ => ParamValue::BigInt(n),
            }
        }
        CType::Double => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            ParamValue::Double(f64::from_ne_bytes(raw))
        }
        CType::Bit => ParamValue::Boolean(bytes[0] != 0),
        CType::Binary => ParamValue::Binary(bytes[..param.data_len()].to_vec()),
        CType::Char => {
            let text = String::from_utf8_lossy(&bytes[..param.data_len()]).into_owned();
            match param.sql_type {
                sql_type::DECIMAL | sql_type::NUMERIC => ParamValue::Decimal(text),
                _ => ParamValue::String(text),
            }
        }
    }
}

/// Parameters owned by a statement or a query job.
#[derive(Debug, Default)]
pub struct ParameterList {
    params: Vec<Parameter>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: &[Param], default_output_len: usize) -> Result<Self> {
        let params = params
            .iter()
            .map(|p| Parameter::new(p, default_output_len))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { params })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn bind(&mut self, cli: &dyn Cli, stmt: RawHandle) -> SqlReturn {
        bind_parameters(cli, stmt, &mut self.params)
    }

    pub fn has_output(&self) -> bool {
        self.params.iter().any(Parameter::has_output)
    }

    /// Values of all output-capable parameters in ordinal order, or `None`
    /// when the list has none.
    pub fn output_values(&self) -> Option<Vec<ParamValue>> {
        if !self.has_output() {
            return None;
        }
        Some(
            self.params
                .iter()
                .filter(|p| p.has_output())
                .map(get_output_parameter)
                .collect(),
        )
    }

    /// Releases every parameter buffer, then the list. Safe on an empty list.
    pub fn free(&mut self) {
        for param in self.params.iter_mut() {
            param.buffer = ParamBuffer::with_capacity(0);
        }
        self.params.clear();
        self.params.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::fake::FakeCli;
    use crate::cli::{Cli, HandleKind};
    use serde_json::json;

    const OUT_LEN: usize = 64;

    #[test]
    fn test_direction_parity() {
        assert!(!ParamDirection::INPUT.has_output());
        assert!(ParamDirection::INPUT_OUTPUT.has_output());
        assert!(ParamDirection::OUTPUT.has_output());
        assert!(ParamDirection(0).has_output());
        assert!(!ParamDirection(3).has_output());
    }

    #[test]
    fn test_direction_names() {
        assert_eq!(ParamDirection::from_name("out"), Some(ParamDirection::OUTPUT));
        assert_eq!(
            ParamDirection::from_name("INPUT_OUTPUT"),
            Some(ParamDirection::INPUT_OUTPUT)
        );
        assert_eq!(ParamDirection::from_name("sideways"), None);
    }

    #[test]
    fn test_param_from_json_scalar_is_input() {
        let p = Param::from_json(&json!("abc")).unwrap();
        assert_eq!(p.direction, ParamDirection::INPUT);
        assert_eq!(p.value, ParamValue::String("abc".into()));
    }

    #[test]
    fn test_param_from_json_object() {
        let p = Param::from_json(&json!({
            "ParamType": "OUTPUT",
            "DataType": 4,
            "Data": 0,
        }))
        .unwrap();
        assert_eq!(p.direction, ParamDirection::OUTPUT);
        assert_eq!(p.sql_type, Some(sql_type::INTEGER));
    }

    #[test]
    fn test_param_from_json_rejects_bad_direction() {
        assert!(Param::from_json(&json!({ "ParamType": "SIDEWAYS" })).is_err());
    }

    #[test]
    fn test_input_string_buffer() {
        let mut p = Parameter::new(&Param::input("hello"), OUT_LEN).unwrap();
        assert_eq!(p.c_type(), CType::Char);
        assert_eq!(p.sql_type(), sql_type::VARCHAR);
        let b = p.binding(1);
        assert_eq!(b.buffer_len, 6);
        assert_eq!(b.column_size, 5);
        assert_eq!(unsafe { *b.indicator_ptr }, 5);
    }

    #[test]
    fn test_output_string_gets_default_room() {
        let mut p = Parameter::new(&Param::output(sql_type::VARCHAR), OUT_LEN).unwrap();
        assert_eq!(p.binding(1).buffer_len, (OUT_LEN + 1) as isize);
    }

    #[test]
    fn test_null_input_indicator() {
        let p = Parameter::new(&Param::input(ParamValue::Null), OUT_LEN).unwrap();
        assert_eq!(get_output_parameter(&p), ParamValue::Null);
    }

    #[test]
    fn test_output_integer_decodes_by_sql_type() {
        let mut p = Parameter::new(&Param::output(sql_type::INTEGER), OUT_LEN).unwrap();
        {
            let b = p.binding(1);
            unsafe {
                std::ptr::copy_nonoverlapping(42i64.to_ne_bytes().as_ptr(), b.value_ptr, 8);
                *b.indicator_ptr = 8;
            }
        }
        assert_eq!(get_output_parameter(&p), ParamValue::Integer(42));
    }

    #[test]
    fn test_output_decimal_decodes_as_text() {
        let mut p = Parameter::new(&Param::output(sql_type::DECIMAL), OUT_LEN).unwrap();
        {
            let b = p.binding(1);
            let text = b"12.50";
            unsafe {
                std::ptr::copy_nonoverlapping(text.as_ptr(), b.value_ptr, text.len());
                *b.indicator_ptr = text.len() as isize;
            }
        }
        assert_eq!(get_output_parameter(&p), ParamValue::Decimal("12.50".into()));
    }

    #[test]
    fn test_decimal_digits_from_literal() {
        let p = Parameter::new(&Param::input(ParamValue::Decimal("3.1415".into())), OUT_LEN)
            .unwrap();
        assert_eq!(p.decimal_digits, 4);
    }

    #[test]
    fn test_output_values_only_for_even_directions() {
        let list = ParameterList::from_params(
            &[
                Param::input(1).with_direction(ParamDirection(1)),
                Param::output(sql_type::INTEGER).with_direction(ParamDirection(0)),
            ],
            OUT_LEN,
        )
        .unwrap();
        let out = list.output_values().unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_output_values_none_without_outputs() {
        let list = ParameterList::from_params(&[Param::input(1)], OUT_LEN).unwrap();
        assert!(list.output_values().is_none());
    }

    #[test]
    fn test_bind_stops_at_first_failure() {
        let fake = FakeCli::new();
        let stmt = fake.alloc_handle(HandleKind::Stmt, RawHandle::NULL).unwrap();
        fake.fail_nth_bind(2, "HY004", "Invalid SQL data type");

        let mut list = ParameterList::from_params(
            &[Param::input(1), Param::input(2), Param::input(3)],
            OUT_LEN,
        )
        .unwrap();
        let rc = list.bind(&fake, stmt);

        assert_eq!(rc, SqlReturn::ERROR);
        assert_eq!(fake.bound_ordinals(stmt), vec![1]);
    }

    #[test]
    fn test_free_empty_list_is_noop() {
        let mut list = ParameterList::new();
        list.free();
        list.free();
        assert!(list.is_empty());
    }

    #[test]
    fn test_free_releases_all() {
        let mut list =
            ParameterList::from_params(&[Param::input("a"), Param::input(2)], OUT_LEN).unwrap();
        list.free();
        assert_eq!(list.len(), 0);
        assert!(list.output_values().is_none());
    }
}
