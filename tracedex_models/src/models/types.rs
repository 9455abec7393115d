// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::FormatError;

/// The primitive types shared by the dex and class-file descriptor grammars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PrimitiveKind {
    Void,
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
}

impl PrimitiveKind {
    pub fn descriptor_char(&self) -> char {
        match self {
            PrimitiveKind::Void => 'V',
            PrimitiveKind::Boolean => 'Z',
            PrimitiveKind::Byte => 'B',
            PrimitiveKind::Short => 'S',
            PrimitiveKind::Char => 'C',
            PrimitiveKind::Int => 'I',
            PrimitiveKind::Long => 'J',
            PrimitiveKind::Float => 'F',
            PrimitiveKind::Double => 'D',
        }
    }

    fn from_descriptor_char(c: char) -> Option<PrimitiveKind> {
        Some(match c {
            'V' => PrimitiveKind::Void,
            'Z' => PrimitiveKind::Boolean,
            'B' => PrimitiveKind::Byte,
            'S' => PrimitiveKind::Short,
            'C' => PrimitiveKind::Char,
            'I' => PrimitiveKind::Int,
            'J' => PrimitiveKind::Long,
            'F' => PrimitiveKind::Float,
            'D' => PrimitiveKind::Double,
            _ => return None,
        })
    }

    /// Wide primitives occupy two registers in dalvik and two stack slots on
    /// the JVM.
    pub fn is_wide(&self) -> bool {
        matches!(self, PrimitiveKind::Long | PrimitiveKind::Double)
    }
}

/// A type as referenced from a descriptor: a primitive, an object reference
/// by qualified binary name ("java/lang/String"), or an array wrapping an
/// element type with a depth counter. Identity is name plus array depth,
/// independent of which container the descriptor came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TypeDescriptor {
    Primitive(PrimitiveKind),
    Object(String),
    Array {
        element: Box<TypeDescriptor>,
        depth: u32,
    },
}

impl TypeDescriptor {
    /// Parse a single field descriptor such as `[[Ljava/lang/String;` or `I`.
    pub fn parse(descriptor: &str) -> Result<TypeDescriptor, FormatError> {
        let (ty, rest) = Self::parse_prefix(descriptor)?;
        if !rest.is_empty() {
            return Err(FormatError::corrupt(format!(
                "trailing characters in type descriptor {:?}",
                descriptor
            )));
        }
        Ok(ty)
    }

    /// Parse one type from the front of `descriptor`, returning the remainder.
    pub fn parse_prefix(descriptor: &str) -> Result<(TypeDescriptor, &str), FormatError> {
        let mut depth = 0u32;
        let mut rest = descriptor;
        while let Some(stripped) = rest.strip_prefix('[') {
            depth += 1;
            rest = stripped;
        }
        let mut chars = rest.chars();
        let first = chars
            .next()
            .ok_or_else(|| FormatError::corrupt("empty type descriptor"))?;
        let (element, remainder) = if let Some(primitive) = PrimitiveKind::from_descriptor_char(first)
        {
            (TypeDescriptor::Primitive(primitive), chars.as_str())
        } else if first == 'L' {
            let end = rest
                .find(';')
                .ok_or_else(|| FormatError::corrupt("unterminated class descriptor"))?;
            (
                TypeDescriptor::Object(rest[1..end].to_string()),
                &rest[end + 1..],
            )
        } else {
            return Err(FormatError::corrupt(format!(
                "unexpected descriptor character {:?}",
                first
            )));
        };
        if depth == 0 {
            Ok((element, remainder))
        } else {
            Ok((
                TypeDescriptor::Array {
                    element: Box::new(element),
                    depth,
                },
                remainder,
            ))
        }
    }

    pub fn array_depth(&self) -> u32 {
        match self {
            TypeDescriptor::Array { depth, .. } => *depth,
            _ => 0,
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(p) if p.is_wide())
    }

    /// The descriptor form, e.g. `[I` or `Ljava/lang/Object;`.
    pub fn to_descriptor(&self) -> String {
        match self {
            TypeDescriptor::Primitive(p) => p.descriptor_char().to_string(),
            TypeDescriptor::Object(name) => format!("L{};", name),
            TypeDescriptor::Array { element, depth } => {
                let mut s = "[".repeat(*depth as usize);
                s.push_str(&element.to_descriptor());
                s
            }
        }
    }

    /// The human-friendly rendering, e.g. `java.lang.String[][]` or `int`.
    pub fn human_name(&self) -> String {
        match self {
            TypeDescriptor::Primitive(p) => match p {
                PrimitiveKind::Void => "void".to_string(),
                PrimitiveKind::Boolean => "boolean".to_string(),
                PrimitiveKind::Byte => "byte".to_string(),
                PrimitiveKind::Short => "short".to_string(),
                PrimitiveKind::Char => "char".to_string(),
                PrimitiveKind::Int => "int".to_string(),
                PrimitiveKind::Long => "long".to_string(),
                PrimitiveKind::Float => "float".to_string(),
                PrimitiveKind::Double => "double".to_string(),
            },
            TypeDescriptor::Object(name) => name.replace('/', "."),
            TypeDescriptor::Array { element, depth } => {
                let mut s = element.human_name();
                for _ in 0..*depth {
                    s.push_str("[]");
                }
                s
            }
        }
    }
}

/// Parse a method descriptor such as `(ILjava/lang/String;)V` into argument
/// and return types.
pub fn parse_method_descriptor(
    descriptor: &str,
) -> Result<(Vec<TypeDescriptor>, TypeDescriptor), FormatError> {
    let rest = descriptor
        .strip_prefix('(')
        .ok_or_else(|| FormatError::corrupt("method descriptor missing '('"))?;
    let close = rest
        .find(')')
        .ok_or_else(|| FormatError::corrupt("method descriptor missing ')'"))?;
    let mut args_str = &rest[..close];
    let mut arguments = vec![];
    while !args_str.is_empty() {
        let (ty, remainder) = TypeDescriptor::parse_prefix(args_str)?;
        arguments.push(ty);
        args_str = remainder;
    }
    let return_type = TypeDescriptor::parse(&rest[close + 1..])?;
    Ok((arguments, return_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_and_object_descriptors() {
        assert_eq!(
            TypeDescriptor::parse("I").unwrap(),
            TypeDescriptor::Primitive(PrimitiveKind::Int)
        );
        assert_eq!(
            TypeDescriptor::parse("Ljava/lang/String;").unwrap(),
            TypeDescriptor::Object("java/lang/String".to_string())
        );
    }

    #[test]
    fn array_depth_is_identity_relevant() {
        let one = TypeDescriptor::parse("[I").unwrap();
        let two = TypeDescriptor::parse("[[I").unwrap();
        assert_ne!(one, two);
        assert_eq!(one.array_depth(), 1);
        assert_eq!(two.array_depth(), 2);
        assert_eq!(two.to_descriptor(), "[[I");
        assert_eq!(two.human_name(), "int[][]");
    }

    #[test]
    fn method_descriptor_roundtrip() {
        let (args, ret) = parse_method_descriptor("(I[Ljava/lang/String;J)V").unwrap();
        assert_eq!(args.len(), 3);
        assert!(args[2].is_wide());
        assert_eq!(ret, TypeDescriptor::Primitive(PrimitiveKind::Void));
    }

    #[test]
    fn corrupt_descriptor_is_an_error() {
        assert!(TypeDescriptor::parse("Q").is_err());
        assert!(TypeDescriptor::parse("Lmissing/semicolon").is_err());
        assert!(parse_method_descriptor("IV").is_err());
    }
}
