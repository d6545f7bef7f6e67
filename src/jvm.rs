//! Decoder for the on-disk JVM class file format.
//!
//! Reads the big-endian container described by JVMS §4 and materializes
//! the pieces the interpreter needs: the constant pool and the methods
//! with their `Code` attribute. Everything else (interfaces, fields,
//! remaining attributes) is consumed at its declared width so the
//! stream cursor stays aligned, and discarded.
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// Magic bytes opening every JVM class file.
const CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

const ATTRIBUTE_NAME_CODE: &str = "Code";

/// Errors produced while decoding a class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnexpectedEof,
    BadMagic(u32),
    UnknownConstantTag(u8),
    InvalidUtf8 { index: u16 },
    ExpectedUtf8 { index: u16 },
    MissingCode { method: String },
    BadDescriptor(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "class file ended prematurely"),
            Self::BadMagic(magic) => {
                write!(f, "bad magic number 0x{magic:08X}, expected 0xCAFEBABE")
            }
            Self::UnknownConstantTag(tag) => {
                write!(f, "unknown constant pool tag {tag}")
            }
            Self::InvalidUtf8 { index } => {
                write!(f, "constant pool entry {index} holds invalid UTF-8")
            }
            Self::ExpectedUtf8 { index } => {
                write!(f, "expected a UTF-8 entry at constant pool index {index}")
            }
            Self::MissingCode { method } => {
                write!(f, "method {method} has no Code attribute")
            }
            Self::BadDescriptor(descriptor) => {
                write!(f, "malformed method descriptor {descriptor:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(_: io::Error) -> Self {
        // Reads from an in-memory cursor only fail by running off the end.
        Self::UnexpectedEof
    }
}

/// `CpInfo` represents the constant pool entries the interpreter
/// consumes. Entries of other tags are decoded for alignment only and
/// stored as `Unused`, as is the reserved slot at index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpInfo {
    Class {
        name_index: u16,
    },
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    Integer {
        value: i32,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    Utf8 {
        bytes: String,
    },
    Unused,
}

/// `ConstantTag` encodes the tag byte of a constant pool entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConstantTag {
    Utf8,
    Integer,
    Float,
    Long,
    Double,
    Class,
    String,
    FieldRef,
    MethodRef,
    InterfaceMethodRef,
    NameAndType,
    MethodHandle,
    MethodType,
    Dynamic,
    InvokeDynamic,
    Module,
    Package,
    Unknown,
}

impl From<u8> for ConstantTag {
    fn from(tag: u8) -> Self {
        match tag {
            1 => Self::Utf8,
            3 => Self::Integer,
            4 => Self::Float,
            5 => Self::Long,
            6 => Self::Double,
            7 => Self::Class,
            8 => Self::String,
            9 => Self::FieldRef,
            10 => Self::MethodRef,
            11 => Self::InterfaceMethodRef,
            12 => Self::NameAndType,
            15 => Self::MethodHandle,
            16 => Self::MethodType,
            17 => Self::Dynamic,
            18 => Self::InvokeDynamic,
            19 => Self::Module,
            20 => Self::Package,
            _ => Self::Unknown,
        }
    }
}

/// The materialized `Code` attribute of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

/// Raw method record: indices into the pool plus the decoded code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub code: Option<CodeAttribute>,
}

/// `ClassFile` is the decoded form of one class file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: Vec<CpInfo>,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub methods: Vec<MethodInfo>,
}

impl ClassFile {
    /// Resolves a pool index to its UTF-8 string, if it holds one.
    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::Utf8 { bytes }) => Some(bytes),
            _ => None,
        }
    }
}

/// `ClassParser` namespaces the class file decoding entry point.
#[derive(Debug)]
pub struct ClassParser;

impl ClassParser {
    /// Decodes a preloaded class file image.
    pub fn parse(class_file_bytes: &[u8]) -> Result<ClassFile, ParseError> {
        let mut buffer = Cursor::new(class_file_bytes);

        let magic = buffer.read_u32::<BigEndian>()?;
        if magic != CLASS_FILE_MAGIC {
            return Err(ParseError::BadMagic(magic));
        }
        // Version numbers are recorded but not validated.
        let minor_version = buffer.read_u16::<BigEndian>()?;
        let major_version = buffer.read_u16::<BigEndian>()?;

        let constant_pool = parse_constant_pool(&mut buffer)?;

        let access_flags = buffer.read_u16::<BigEndian>()?;
        let this_class = buffer.read_u16::<BigEndian>()?;
        let super_class = buffer.read_u16::<BigEndian>()?;

        let interfaces_count = buffer.read_u16::<BigEndian>()?;
        skip(&mut buffer, 2 * u64::from(interfaces_count))?;

        parse_fields(&mut buffer)?;
        let methods = parse_methods(&mut buffer, &constant_pool)?;
        // Class-level attributes (SourceFile and friends).
        skip_attributes(&mut buffer)?;

        debug!(
            "parsed class file: {} constant pool entries, {} methods",
            constant_pool.len(),
            methods.len()
        );

        Ok(ClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            methods,
        })
    }
}

fn parse_constant_pool(
    buffer: &mut Cursor<&[u8]>,
) -> Result<Vec<CpInfo>, ParseError> {
    let count = buffer.read_u16::<BigEndian>()?;
    // Index 0 is reserved by the JVMS; it stays `Unused`.
    let mut pool = vec![CpInfo::Unused; count as usize];

    let mut index = 1usize;
    while index < count as usize {
        let tag = buffer.read_u8()?;
        // Long and double entries occupy two pool slots.
        let mut slots = 1usize;
        match ConstantTag::from(tag) {
            ConstantTag::Utf8 => {
                let length = buffer.read_u16::<BigEndian>()?;
                let mut bytes = vec![0u8; length as usize];
                buffer.read_exact(&mut bytes)?;
                let bytes = String::from_utf8(bytes).map_err(|_| {
                    ParseError::InvalidUtf8 {
                        index: index as u16,
                    }
                })?;
                pool[index] = CpInfo::Utf8 { bytes };
            }
            ConstantTag::Integer => {
                pool[index] = CpInfo::Integer {
                    value: buffer.read_i32::<BigEndian>()?,
                };
            }
            ConstantTag::Class => {
                pool[index] = CpInfo::Class {
                    name_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::FieldRef => {
                pool[index] = CpInfo::FieldRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::MethodRef => {
                pool[index] = CpInfo::MethodRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::NameAndType => {
                pool[index] = CpInfo::NameAndType {
                    name_index: buffer.read_u16::<BigEndian>()?,
                    descriptor_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            // The remaining defined tags are consumed at their declared
            // width and discarded.
            ConstantTag::Float => skip(buffer, 4)?,
            ConstantTag::Long | ConstantTag::Double => {
                skip(buffer, 8)?;
                slots = 2;
            }
            ConstantTag::String
            | ConstantTag::MethodType
            | ConstantTag::Module
            | ConstantTag::Package => skip(buffer, 2)?,
            ConstantTag::MethodHandle => skip(buffer, 3)?,
            ConstantTag::InterfaceMethodRef
            | ConstantTag::Dynamic
            | ConstantTag::InvokeDynamic => skip(buffer, 4)?,
            ConstantTag::Unknown => {
                return Err(ParseError::UnknownConstantTag(tag))
            }
        }
        index += slots;
    }
    Ok(pool)
}

fn parse_fields(buffer: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let fields_count = buffer.read_u16::<BigEndian>()?;
    for _ in 0..fields_count {
        // access_flags, name_index, descriptor_index
        skip(buffer, 6)?;
        skip_attributes(buffer)?;
    }
    Ok(())
}

fn parse_methods(
    buffer: &mut Cursor<&[u8]>,
    constant_pool: &[CpInfo],
) -> Result<Vec<MethodInfo>, ParseError> {
    let methods_count = buffer.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(methods_count as usize);

    for _ in 0..methods_count {
        let access_flags = buffer.read_u16::<BigEndian>()?;
        let name_index = buffer.read_u16::<BigEndian>()?;
        let descriptor_index = buffer.read_u16::<BigEndian>()?;

        let mut code = None;
        let attributes_count = buffer.read_u16::<BigEndian>()?;
        for _ in 0..attributes_count {
            let attribute_name_index = buffer.read_u16::<BigEndian>()?;
            let attribute_length = buffer.read_u32::<BigEndian>()?;
            let attribute_name =
                utf8_constant(constant_pool, attribute_name_index)?;
            if attribute_name == ATTRIBUTE_NAME_CODE {
                code = Some(parse_code_attribute(buffer)?);
            } else {
                skip(buffer, u64::from(attribute_length))?;
            }
        }

        methods.push(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            code,
        });
    }
    Ok(methods)
}

fn parse_code_attribute(
    buffer: &mut Cursor<&[u8]>,
) -> Result<CodeAttribute, ParseError> {
    let max_stack = buffer.read_u16::<BigEndian>()?;
    let max_locals = buffer.read_u16::<BigEndian>()?;
    let code_length = buffer.read_u32::<BigEndian>()?;
    let mut code = vec![0u8; code_length as usize];
    buffer.read_exact(&mut code)?;

    // Exception handlers are not interpreted; 8 bytes per entry.
    let exception_table_length = buffer.read_u16::<BigEndian>()?;
    skip(buffer, 8 * u64::from(exception_table_length))?;
    // Nested attributes (LineNumberTable, StackMapTable, ...).
    skip_attributes(buffer)?;

    Ok(CodeAttribute {
        max_stack,
        max_locals,
        code,
    })
}

fn skip_attributes(buffer: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let attributes_count = buffer.read_u16::<BigEndian>()?;
    for _ in 0..attributes_count {
        // attribute_name_index
        skip(buffer, 2)?;
        let attribute_length = buffer.read_u32::<BigEndian>()?;
        skip(buffer, u64::from(attribute_length))?;
    }
    Ok(())
}

fn skip(buffer: &mut Cursor<&[u8]>, count: u64) -> Result<(), ParseError> {
    // A skip landing past the end must surface as EOF rather than let
    // the cursor seek into nowhere and mask the truncation.
    let position = buffer
        .position()
        .checked_add(count)
        .ok_or(ParseError::UnexpectedEof)?;
    if position > buffer.get_ref().len() as u64 {
        return Err(ParseError::UnexpectedEof);
    }
    buffer.seek(SeekFrom::Start(position))?;
    Ok(())
}

fn utf8_constant(pool: &[CpInfo], index: u16) -> Result<&str, ParseError> {
    match pool.get(index as usize) {
        Some(CpInfo::Utf8 { bytes }) => Ok(bytes),
        _ => Err(ParseError::ExpectedUtf8 { index }),
    }
}

/// Reads a class file from disk into a byte buffer.
pub fn read_class_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u16(buffer: &mut Vec<u8>, value: u16) {
        buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(buffer: &mut Vec<u8>, value: u32) {
        buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn put_utf8(buffer: &mut Vec<u8>, text: &str) {
        buffer.push(1);
        put_u16(buffer, text.len() as u16);
        buffer.extend_from_slice(text.as_bytes());
    }

    // A class with one static void method whose body is a lone `return`,
    // plus pool entries of every skipped width to exercise alignment.
    fn sample_class() -> Vec<u8> {
        let mut buffer = Vec::new();
        put_u32(&mut buffer, 0xCAFE_BABE);
        put_u16(&mut buffer, 0); // minor
        put_u16(&mut buffer, 55); // major

        // Constant pool: 1 "Code", 2 "main", 3 descriptor, 4 Integer 99,
        // 5 Float (skipped), 6+7 Long (skipped, two slots), 8 String
        // (skipped), 9 "Extra".
        put_u16(&mut buffer, 10); // constant_pool_count
        put_utf8(&mut buffer, "Code");
        put_utf8(&mut buffer, "main");
        put_utf8(&mut buffer, "([Ljava/lang/String;)V");
        buffer.push(3);
        put_u32(&mut buffer, 99);
        buffer.push(4);
        put_u32(&mut buffer, 0x3F80_0000);
        buffer.push(5);
        put_u32(&mut buffer, 0);
        put_u32(&mut buffer, 1);
        buffer.push(8);
        put_u16(&mut buffer, 2);
        put_utf8(&mut buffer, "Extra");

        put_u16(&mut buffer, 0x0021); // access_flags
        put_u16(&mut buffer, 0); // this_class
        put_u16(&mut buffer, 0); // super_class
        put_u16(&mut buffer, 0); // interfaces_count
        put_u16(&mut buffer, 0); // fields_count

        put_u16(&mut buffer, 1); // methods_count
        put_u16(&mut buffer, 0x0009); // ACC_PUBLIC | ACC_STATIC
        put_u16(&mut buffer, 2); // name_index -> "main"
        put_u16(&mut buffer, 3); // descriptor_index
        put_u16(&mut buffer, 2); // attributes_count
        // An attribute the decoder does not know, skipped by length.
        put_u16(&mut buffer, 9);
        put_u32(&mut buffer, 3);
        buffer.extend_from_slice(&[0xde, 0xad, 0x00]);
        // The Code attribute.
        put_u16(&mut buffer, 1);
        put_u32(&mut buffer, 13);
        put_u16(&mut buffer, 2); // max_stack
        put_u16(&mut buffer, 1); // max_locals
        put_u32(&mut buffer, 1); // code_length
        buffer.push(0xb1); // return
        put_u16(&mut buffer, 0); // exception_table_length
        put_u16(&mut buffer, 0); // nested attributes_count

        put_u16(&mut buffer, 0); // class attributes_count
        buffer
    }

    #[test]
    fn parses_a_minimal_class() {
        let class_file = ClassParser::parse(&sample_class()).unwrap();
        assert_eq!(class_file.major_version, 55);
        assert_eq!(class_file.methods.len(), 1);

        let method = &class_file.methods[0];
        assert_eq!(class_file.utf8(method.name_index), Some("main"));
        assert_eq!(
            class_file.utf8(method.descriptor_index),
            Some("([Ljava/lang/String;)V")
        );
        let code = method.code.as_ref().unwrap();
        assert_eq!(code.max_stack, 2);
        assert_eq!(code.max_locals, 1);
        assert_eq!(code.code, vec![0xb1]);
    }

    #[test]
    fn skipped_tags_keep_the_cursor_aligned() {
        let class_file = ClassParser::parse(&sample_class()).unwrap();
        assert_eq!(class_file.constant_pool[4], CpInfo::Integer { value: 99 });
        // Float, the two long slots, and String all decode to Unused.
        assert_eq!(class_file.constant_pool[5], CpInfo::Unused);
        assert_eq!(class_file.constant_pool[6], CpInfo::Unused);
        assert_eq!(class_file.constant_pool[7], CpInfo::Unused);
        assert_eq!(class_file.constant_pool[8], CpInfo::Unused);
        assert_eq!(
            class_file.utf8(9),
            Some("Extra"),
            "entry after the skipped region must still resolve"
        );
    }

    #[test]
    fn index_zero_is_reserved() {
        let class_file = ClassParser::parse(&sample_class()).unwrap();
        assert_eq!(class_file.constant_pool[0], CpInfo::Unused);
        assert_eq!(class_file.utf8(0), None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_class();
        bytes[0] = 0xCA;
        bytes[1] = 0xFF;
        assert!(matches!(
            ClassParser::parse(&bytes),
            Err(ParseError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_truncated_stream() {
        let bytes = sample_class();
        for cut in [3, 9, 20, bytes.len() - 4] {
            assert_eq!(
                ClassParser::parse(&bytes[..cut]),
                Err(ParseError::UnexpectedEof),
                "truncation at {cut} bytes must fail"
            );
        }
    }

    #[test]
    fn rejects_unknown_constant_tag() {
        let mut buffer = Vec::new();
        put_u32(&mut buffer, 0xCAFE_BABE);
        put_u16(&mut buffer, 0);
        put_u16(&mut buffer, 55);
        put_u16(&mut buffer, 2);
        buffer.push(13); // tag 13 is not defined by the JVMS
        assert_eq!(
            ClassParser::parse(&buffer),
            Err(ParseError::UnknownConstantTag(13))
        );
    }
}
