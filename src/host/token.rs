use std::fmt;

/// A metadata token as the host JIT hands it out.
///
/// The high byte selects the metadata table, the low 24 bits are the row. Tokens only have
/// meaning together with the module (scope) they were read from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// `TypeRef` table
    pub const TYPE_REF: u8 = 0x01;
    /// `TypeDef` table
    pub const TYPE_DEF: u8 = 0x02;
    /// `Field` table
    pub const FIELD: u8 = 0x04;
    /// `MethodDef` table
    pub const METHOD_DEF: u8 = 0x06;
    /// `MemberRef` table
    pub const MEMBER_REF: u8 = 0x0A;
    /// `StandAloneSig` table
    pub const STANDALONE_SIG: u8 = 0x11;
    /// `TypeSpec` table
    pub const TYPE_SPEC: u8 = 0x1B;
    /// `MethodSpec` table
    pub const METHOD_SPEC: u8 = 0x2B;
    /// User string heap
    pub const USER_STRING: u8 = 0x70;

    /// Creates a token from its raw value
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table and a row
    #[must_use]
    pub const fn from_parts(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw token value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// The table selector (high byte)
    #[must_use]
    pub const fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The row index (low 24 bits)
    #[must_use]
    pub const fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// `true` for the nil token
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// `true` if the token names a method (definition, reference or instantiation)
    #[must_use]
    pub const fn is_method(&self) -> bool {
        matches!(
            self.table(),
            Self::METHOD_DEF | Self::MEMBER_REF | Self::METHOD_SPEC
        )
    }

    /// `true` if the token names a type
    #[must_use]
    pub const fn is_type(&self) -> bool {
        matches!(
            self.table(),
            Self::TYPE_REF | Self::TYPE_DEF | Self::TYPE_SPEC
        )
    }

    /// Encodes a `TypeDefOrRef` coded index as used inside signature blobs.
    ///
    /// Returns `None` for tokens of other tables.
    #[must_use]
    pub fn type_def_or_ref_coded(&self) -> Option<u32> {
        let tag = match self.table() {
            Self::TYPE_DEF => 0,
            Self::TYPE_REF => 1,
            Self::TYPE_SPEC => 2,
            _ => return None,
        };
        Some((self.row() << 2) | tag)
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
