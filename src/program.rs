//! Abstract representation of the loaded class.
//!
//! `Program` is the immutable class image the interpreter consumes:
//! the constant pool plus the methods resolved to their names,
//! descriptors and code. Method descriptors are parsed here as well,
//! both to validate them and to know how many arguments an
//! `invokestatic` call site must transfer.
use crate::jvm::{ClassFile, CpInfo, ParseError};
use regex::Regex;
use std::fmt;

/// Primitive and reference kinds a descriptor token can denote.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Byte,
    Char,
    Short,
    Int,
    Boolean,
    Float,
    Long,
    Double,
    Void,
    Object,
    List,
}

/// A decoded descriptor token. Array types carry their element type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    t: BaseTypeKind,
    sub_t: Option<Box<Type>>,
}

impl Type {
    const fn primitive(t: BaseTypeKind) -> Self {
        Self { t, sub_t: None }
    }

    pub const fn kind(&self) -> BaseTypeKind {
        self.t
    }
}

/// Errors raised when a call site cannot be resolved to a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    MethodNotFound { name: String, descriptor: String },
    BadMethodRef(u16),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MethodNotFound { name, descriptor } => {
                write!(f, "method {name}{descriptor} not found")
            }
            Self::BadMethodRef(index) => {
                write!(
                    f,
                    "constant pool index {index} does not resolve to a method reference"
                )
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// A method of the loaded class, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    arg_types: Vec<Type>,
    return_type: Type,
}

impl Method {
    /// Builds a method record, parsing and validating its descriptor.
    pub fn new(
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Result<Self, ParseError> {
        let (arg_types, return_type) = parse_method_types(descriptor)?;
        Ok(Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            max_stack,
            max_locals,
            code,
            arg_types,
            return_type,
        })
    }

    /// Number of declared parameters (top-level descriptor tokens).
    pub fn parameter_count(&self) -> u16 {
        self.arg_types.len() as u16
    }

    pub fn return_type(&self) -> &Type {
        &self.return_type
    }
}

/// The immutable class image: constant pool and method table.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub constant_pool: Vec<CpInfo>,
    pub methods: Vec<Method>,
}

impl Program {
    /// Builds the class image from a decoded class file.
    pub fn new(class_file: &ClassFile) -> Result<Self, ParseError> {
        let mut methods = Vec::with_capacity(class_file.methods.len());
        for method_info in &class_file.methods {
            let name = class_file.utf8(method_info.name_index).ok_or(
                ParseError::ExpectedUtf8 {
                    index: method_info.name_index,
                },
            )?;
            let descriptor = class_file.utf8(method_info.descriptor_index).ok_or(
                ParseError::ExpectedUtf8 {
                    index: method_info.descriptor_index,
                },
            )?;
            let code = method_info.code.as_ref().ok_or_else(|| {
                ParseError::MissingCode {
                    method: name.to_string(),
                }
            })?;
            methods.push(Method::new(
                name,
                descriptor,
                code.max_stack,
                code.max_locals,
                code.code.clone(),
            )?);
        }
        Ok(Self {
            constant_pool: class_file.constant_pool.clone(),
            methods,
        })
    }

    /// Returns the unique method with the given name and descriptor.
    pub fn find_method(
        &self,
        name: &str,
        descriptor: &str,
    ) -> Result<&Method, ResolveError> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
            .ok_or_else(|| ResolveError::MethodNotFound {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })
    }

    /// Resolves a Methodref pool index to a method of this class.
    pub fn find_method_from_index(
        &self,
        index: u16,
    ) -> Result<&Method, ResolveError> {
        let (_, name, descriptor) = self.method_ref_target(index)?;
        self.find_method(name, descriptor)
    }

    /// Resolves a Methodref to its (class name, method name, descriptor)
    /// triple by chasing the Class and NameAndType entries.
    pub fn method_ref_target(
        &self,
        index: u16,
    ) -> Result<(&str, &str, &str), ResolveError> {
        let Some(CpInfo::MethodRef {
            class_index,
            name_and_type_index,
        }) = self.constant_pool.get(index as usize)
        else {
            return Err(ResolveError::BadMethodRef(index));
        };
        let Some(CpInfo::Class { name_index }) =
            self.constant_pool.get(*class_index as usize)
        else {
            return Err(ResolveError::BadMethodRef(index));
        };
        let class_name = self
            .utf8_at(*name_index)
            .ok_or(ResolveError::BadMethodRef(index))?;
        let Some(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        }) = self.constant_pool.get(*name_and_type_index as usize)
        else {
            return Err(ResolveError::BadMethodRef(index));
        };
        let name = self
            .utf8_at(*name_index)
            .ok_or(ResolveError::BadMethodRef(index))?;
        let descriptor = self
            .utf8_at(*descriptor_index)
            .ok_or(ResolveError::BadMethodRef(index))?;
        Ok((class_name, name, descriptor))
    }

    /// Returns the integer constant at a pool index, if one is there.
    pub fn integer_at(&self, index: u16) -> Option<i32> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::Integer { value }) => Some(*value),
            _ => None,
        }
    }

    fn utf8_at(&self, index: u16) -> Option<&str> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::Utf8 { bytes }) => Some(bytes),
            _ => None,
        }
    }
}

// Splits a descriptor `(T1..Tn)R` into argument and return types.
fn parse_method_types(descriptor: &str) -> Result<(Vec<Type>, Type), ParseError> {
    let re = Regex::new(r"^\(([^)]*)\)(.+)$").unwrap();
    let captures = re
        .captures(descriptor)
        .ok_or_else(|| ParseError::BadDescriptor(descriptor.to_string()))?;
    let arg_string = captures.get(1).map_or("", |m| m.as_str());
    let return_string = captures.get(2).map_or("", |m| m.as_str());

    let mut arg_types = Vec::new();
    let mut rest = arg_string;
    while !rest.is_empty() {
        let (t, consumed) = decode_type(rest)
            .ok_or_else(|| ParseError::BadDescriptor(descriptor.to_string()))?;
        arg_types.push(t);
        rest = &rest[consumed..];
    }

    let (return_type, consumed) = decode_type(return_string)
        .ok_or_else(|| ParseError::BadDescriptor(descriptor.to_string()))?;
    if consumed != return_string.len() {
        return Err(ParseError::BadDescriptor(descriptor.to_string()));
    }
    Ok((arg_types, return_type))
}

// Decodes one descriptor token, returning it and its character length.
fn decode_type(type_str: &str) -> Option<(Type, usize)> {
    match type_str.as_bytes().first()? {
        b'B' => Some((Type::primitive(BaseTypeKind::Byte), 1)),
        b'C' => Some((Type::primitive(BaseTypeKind::Char), 1)),
        b'S' => Some((Type::primitive(BaseTypeKind::Short), 1)),
        b'I' => Some((Type::primitive(BaseTypeKind::Int), 1)),
        b'Z' => Some((Type::primitive(BaseTypeKind::Boolean), 1)),
        b'F' => Some((Type::primitive(BaseTypeKind::Float), 1)),
        b'J' => Some((Type::primitive(BaseTypeKind::Long), 1)),
        b'D' => Some((Type::primitive(BaseTypeKind::Double), 1)),
        b'V' => Some((Type::primitive(BaseTypeKind::Void), 1)),
        b'L' => {
            let end = type_str.find(';')?;
            Some((Type::primitive(BaseTypeKind::Object), end + 1))
        }
        b'[' => {
            let (sub_t, consumed) = decode_type(&type_str[1..])?;
            let t = Type {
                t: BaseTypeKind::List,
                sub_t: Some(Box::new(sub_t)),
            };
            Some((t, consumed + 1))
        }
        _ => None,
    }
}
