/// A SQLSTATE error code
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct SqlState(Inner);

impl SqlState {
    /// Creates a `SqlState` from its error code.
    pub fn from_code(s: &str) -> SqlState {
        match Self::state(s) {
            Some(state) => state,
            None => SqlState(Inner::Other(s.into())),
        }
    }

    /// Returns the error code corresponding to the `SqlState`.
    pub fn code(&self) -> &str {
        match &self.0 {
            Inner::E08000 => "08000",
            Inner::E08003 => "08003",
            Inner::E08006 => "08006",
            Inner::E0A000 => "0A000",
            Inner::E22000 => "22000",
            Inner::E22001 => "22001",
            Inner::E22003 => "22003",
            Inner::E22007 => "22007",
            Inner::E22012 => "22012",
            Inner::E22P02 => "22P02",
            Inner::E23000 => "23000",
            Inner::E23502 => "23502",
            Inner::E23503 => "23503",
            Inner::E23505 => "23505",
            Inner::E23514 => "23514",
            Inner::E23P01 => "23P01",
            Inner::E25006 => "25006",
            Inner::E25P02 => "25P02",
            Inner::E26000 => "26000",
            Inner::E28000 => "28000",
            Inner::E28P01 => "28P01",
            Inner::E3D000 => "3D000",
            Inner::E40001 => "40001",
            Inner::E40P01 => "40P01",
            Inner::E42501 => "42501",
            Inner::E42601 => "42601",
            Inner::E42703 => "42703",
            Inner::E42883 => "42883",
            Inner::E42P01 => "42P01",
            Inner::E53300 => "53300",
            Inner::E57014 => "57014",
            Inner::E57P01 => "57P01",
            Inner::Other(code) => code,
        }
    }

    fn state(s: &str) -> Option<SqlState> {
        let inner = match s {
            "08000" => Inner::E08000,
            "08003" => Inner::E08003,
            "08006" => Inner::E08006,
            "0A000" => Inner::E0A000,
            "22000" => Inner::E22000,
            "22001" => Inner::E22001,
            "22003" => Inner::E22003,
            "22007" => Inner::E22007,
            "22012" => Inner::E22012,
            "22P02" => Inner::E22P02,
            "23000" => Inner::E23000,
            "23502" => Inner::E23502,
            "23503" => Inner::E23503,
            "23505" => Inner::E23505,
            "23514" => Inner::E23514,
            "23P01" => Inner::E23P01,
            "25006" => Inner::E25006,
            "25P02" => Inner::E25P02,
            "26000" => Inner::E26000,
            "28000" => Inner::E28000,
            "28P01" => Inner::E28P01,
            "3D000" => Inner::E3D000,
            "40001" => Inner::E40001,
            "40P01" => Inner::E40P01,
            "42501" => Inner::E42501,
            "42601" => Inner::E42601,
            "42703" => Inner::E42703,
            "42883" => Inner::E42883,
            "42P01" => Inner::E42P01,
            "53300" => Inner::E53300,
            "57014" => Inner::E57014,
            "57P01" => Inner::E57P01,
            _ => return None,
        };
        Some(SqlState(inner))
    }

    /// 08000
    pub const CONNECTION_EXCEPTION: SqlState = SqlState(Inner::E08000);
    /// 08003
    pub const CONNECTION_DOES_NOT_EXIST: SqlState = SqlState(Inner::E08003);
    /// 08006
    pub const CONNECTION_FAILURE: SqlState = SqlState(Inner::E08006);
    /// 0A000
    pub const FEATURE_NOT_SUPPORTED: SqlState = SqlState(Inner::E0A000);
    /// 22000
    pub const DATA_EXCEPTION: SqlState = SqlState(Inner::E22000);
    /// 22001
    pub const STRING_DATA_RIGHT_TRUNCATION: SqlState = SqlState(Inner::E22001);
    /// 22003
    pub const NUMERIC_VALUE_OUT_OF_RANGE: SqlState = SqlState(Inner::E22003);
    /// 22007
    pub const INVALID_DATETIME_FORMAT: SqlState = SqlState(Inner::E22007);
    /// 22012
    pub const DIVISION_BY_ZERO: SqlState = SqlState(Inner::E22012);
    /// 22P02
    pub const INVALID_TEXT_REPRESENTATION: SqlState = SqlState(Inner::E22P02);
    /// 23000
    pub const INTEGRITY_CONSTRAINT_VIOLATION: SqlState = SqlState(Inner::E23000);
    /// 23502
    pub const NOT_NULL_VIOLATION: SqlState = SqlState(Inner::E23502);
    /// 23503
    pub const FOREIGN_KEY_VIOLATION: SqlState = SqlState(Inner::E23503);
    /// 23505
    pub const UNIQUE_VIOLATION: SqlState = SqlState(Inner::E23505);
    /// 23514
    pub const CHECK_VIOLATION: SqlState = SqlState(Inner::E23514);
    /// 23P01
    pub const EXCLUSION_VIOLATION: SqlState = SqlState(Inner::E23P01);
    /// 25006
    pub const READ_ONLY_SQL_TRANSACTION: SqlState = SqlState(Inner::E25006);
    /// 25P02
    pub const IN_FAILED_SQL_TRANSACTION: SqlState = SqlState(Inner::E25P02);
    /// 26000
    pub const INVALID_SQL_STATEMENT_NAME: SqlState = SqlState(Inner::E26000);
    /// 28000
    pub const INVALID_AUTHORIZATION_SPECIFICATION: SqlState = SqlState(Inner::E28000);
    /// 28P01
    pub const INVALID_PASSWORD: SqlState = SqlState(Inner::E28P01);
    /// 3D000
    pub const INVALID_CATALOG_NAME: SqlState = SqlState(Inner::E3D000);
    /// 40001
    pub const T_R_SERIALIZATION_FAILURE: SqlState = SqlState(Inner::E40001);
    /// 40P01
    pub const T_R_DEADLOCK_DETECTED: SqlState = SqlState(Inner::E40P01);
    /// 42501
    pub const INSUFFICIENT_PRIVILEGE: SqlState = SqlState(Inner::E42501);
    /// 42601
    pub const SYNTAX_ERROR: SqlState = SqlState(Inner::E42601);
    /// 42703
    pub const UNDEFINED_COLUMN: SqlState = SqlState(Inner::E42703);
    /// 42883
    pub const UNDEFINED_FUNCTION: SqlState = SqlState(Inner::E42883);
    /// 42P01
    pub const UNDEFINED_TABLE: SqlState = SqlState(Inner::E42P01);
    /// 53300
    pub const TOO_MANY_CONNECTIONS: SqlState = SqlState(Inner::E53300);
    /// 57014
    pub const QUERY_CANCELED: SqlState = SqlState(Inner::E57014);
    /// 57P01
    pub const ADMIN_SHUTDOWN: SqlState = SqlState(Inner::E57P01);
}

#[derive(PartialEq, Eq, Clone, Debug)]
enum Inner {
    E08000,
    E08003,
    E08006,
    E0A000,
    E22000,
    E22001,
    E22003,
    E22007,
    E22012,
    E22P02,
    E23000,
    E23502,
    E23503,
    E23505,
    E23514,
    E23P01,
    E25006,
    E25P02,
    E26000,
    E28000,
    E28P01,
    E3D000,
    E40001,
    E40P01,
    E42501,
    E42601,
    E42703,
    E42883,
    E42P01,
    E53300,
    E57014,
    E57P01,
    Other(Box<str>),
}
