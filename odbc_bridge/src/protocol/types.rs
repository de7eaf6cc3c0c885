/// ODBC SQL data type codes used when binding parameters.
pub mod sql_type {
    pub const CHAR: i16 = 1;
    pub const NUMERIC: i16 = 2;
    pub const DECIMAL: i16 = 3;
    pub const INTEGER: i16 = 4;
    pub const SMALLINT: i16 = 5;
    pub const FLOAT: i16 = 6;
    pub const REAL: i16 = 7;
    pub const DOUBLE: i16 = 8;
    pub const VARCHAR: i16 = 12;
    pub const LONGVARCHAR: i16 = -1;
    pub const BINARY: i16 = -2;
    pub const VARBINARY: i16 = -3;
    pub const LONGVARBINARY: i16 = -4;
    pub const BIGINT: i16 = -5;
    pub const TINYINT: i16 = -6;
    pub const BIT: i16 = -7;
}

/// C buffer layouts the engine binds. Discriminants are the ODBC
/// `SQL_C_*` codes.
#[repr(i16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CType {
    Char = 1,
    Double = 8,
    Binary = -2,
    Bit = -7,
    SBigInt = -25,
}

impl CType {
    /// Buffer layout used to receive a value of `sql_type`.
    pub fn for_sql_type(sql_type: i16) -> Self {
        match sql_type {
            sql_type::INTEGER | sql_type::SMALLINT | sql_type::TINYINT | sql_type::BIGINT => {
                CType::SBigInt
            }
            sql_type::FLOAT | sql_type::REAL | sql_type::DOUBLE => CType::Double,
            sql_type::BIT => CType::Bit,
            sql_type::BINARY | sql_type::VARBINARY | sql_type::LONGVARBINARY => CType::Binary,
            _ => CType::Char,
        }
    }

    /// Size of fixed-width layouts, `None` for character and binary data.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            CType::SBigInt | CType::Double => Some(8),
            CType::Bit => Some(1),
            CType::Char | CType::Binary => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_type_codes() {
        assert_eq!(CType::Char as i16, 1);
        assert_eq!(CType::SBigInt as i16, -25);
        assert_eq!(CType::Binary as i16, -2);
    }

    #[test]
    fn test_integer_families_use_bigint_buffers() {
        for t in [
            sql_type::INTEGER,
            sql_type::SMALLINT,
            sql_type::TINYINT,
            sql_type::BIGINT,
        ] {
            assert_eq!(CType::for_sql_type(t), CType::SBigInt);
        }
    }

    #[test]
    fn test_decimal_is_received_as_text() {
        assert_eq!(CType::for_sql_type(sql_type::DECIMAL), CType::Char);
        assert_eq!(CType::for_sql_type(sql_type::VARCHAR), CType::Char);
        assert_eq!(CType::for_sql_type(sql_type::VARBINARY), CType::Binary);
    }

    #[test]
    fn test_fixed_width() {
        assert_eq!(CType::Double.fixed_width(), Some(8));
        assert_eq!(CType::Bit.fixed_width(), Some(1));
        assert_eq!(CType::Char.fixed_width(), None);
    }
}
