//! Types, struct/union layout, and the scoped environment.
//!
//! Struct bodies live in one flat table indexed by [StructId]; a
//! self-referential struct points back at itself through the id, never
//! through a cyclic pointer. The environment is a single stack of frames,
//! each frame holding the four name spaces (variables, typedefs, struct
//! tags, enum constants), so every lookup walks the same scope chain.

use derive_more::Display;

use crate::common::align_up;

/// Stable index of a struct/union record.
pub type StructId = usize;
/// Index of a variable in the program-wide variable table.
pub type VarId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeKind {
    /// `int`, signed 32 bit.
    Int,
    /// `_Bool`, 8 bit, holds 0 or 1.
    Bool,
    Char,
    Short,
    Long,
    LongLong,
    Void,
    /// A string literal; sized and aligned like a pointer.
    Str,
    Struct(StructId),
    Ptr,
    /// An array of the given element count; the element type is the pointee.
    Array(usize),
    /// Transient wrapper for a declaration carrying `typedef`; stripped when
    /// the alias is registered.
    Typedef,
    /// Sentinel for "no type". Not a real type.
    Null,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Type {
    pub kind: TypeKind,
    /// Pointed-to type for [TypeKind::Ptr], element type for
    /// [TypeKind::Array], aliased type for [TypeKind::Typedef].
    pub pointee: Option<Box<Type>>,
    pub signed: bool,
}

impl Type {
    pub fn new(kind: TypeKind) -> Type {
        Type {
            kind,
            pointee: None,
            signed: true,
        }
    }

    pub fn int() -> Type {
        Type::new(TypeKind::Int)
    }

    pub fn long() -> Type {
        Type::new(TypeKind::Long)
    }

    pub fn ptr_to(inner: Type) -> Type {
        Type {
            kind: TypeKind::Ptr,
            pointee: Some(Box::new(inner)),
            signed: false,
        }
    }

    pub fn array_of(elem: Type, len: usize) -> Type {
        Type {
            kind: TypeKind::Array(len),
            pointee: Some(Box::new(elem)),
            signed: false,
        }
    }

    pub fn pointee(&self) -> &Type {
        self.pointee
            .as_deref()
            .unwrap_or_else(|| unreachable!("type {:?} has no pointee", self.kind))
    }

    /// Pointer or array (an array decays to the address of its first
    /// element everywhere a value is needed).
    pub fn is_ptr_like(&self) -> bool {
        matches!(self.kind, TypeKind::Ptr | TypeKind::Array(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Int
                | TypeKind::Bool
                | TypeKind::Char
                | TypeKind::Short
                | TypeKind::Long
                | TypeKind::LongLong
        )
    }
}

/// Size in bytes, or `None` for a struct that is declared but not defined.
pub fn try_size_of(ty: &Type, structs: &[StructRecord]) -> Option<usize> {
    Some(match ty.kind {
        TypeKind::Int => 4,
        TypeKind::Bool | TypeKind::Char => 1,
        TypeKind::Short => 2,
        TypeKind::Long | TypeKind::LongLong | TypeKind::Ptr | TypeKind::Str => 8,
        TypeKind::Void => 0,
        TypeKind::Struct(id) => {
            let record = &structs[id];
            if !record.defined {
                return None;
            }
            record.size
        }
        TypeKind::Array(len) => len * try_size_of(ty.pointee(), structs)?,
        TypeKind::Typedef | TypeKind::Null => unreachable!("sizeof {:?}", ty.kind),
    })
}

/// Size in bytes. All struct uses are validated by the front end, so an
/// undefined struct here is a compiler bug.
pub fn size_of(ty: &Type, structs: &[StructRecord]) -> usize {
    try_size_of(ty, structs).unwrap_or_else(|| unreachable!("sizeof undefined struct"))
}

pub fn try_align_of(ty: &Type, structs: &[StructRecord]) -> Option<usize> {
    Some(match ty.kind {
        TypeKind::Array(_) | TypeKind::Str => 8,
        TypeKind::Struct(id) => {
            let record = &structs[id];
            if !record.defined {
                return None;
            }
            record.align
        }
        _ => try_size_of(ty, structs)?,
    })
}

pub fn align_of(ty: &Type, structs: &[StructRecord]) -> usize {
    try_align_of(ty, structs).unwrap_or_else(|| unreachable!("alignof undefined struct"))
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    /// Byte offset from the start of the struct; 0 for every union member.
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub struct StructRecord {
    pub name: Option<String>,
    pub is_union: bool,
    pub fields: Vec<Field>,
    pub size: usize,
    pub align: usize,
    /// False between a forward declaration and the body.
    pub defined: bool,
}

impl StructRecord {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Compute member offsets and the total size/alignment for a struct or
/// union body. `None` if a member's own size is not known yet.
pub fn layout_fields(
    members: Vec<(String, Type)>,
    is_union: bool,
    structs: &[StructRecord],
) -> Option<(Vec<Field>, usize, usize)> {
    let mut fields = vec![];
    let mut size = 0usize;
    let mut align = 1usize;
    for (name, ty) in members {
        let field_size = try_size_of(&ty, structs)?;
        let field_align = try_align_of(&ty, structs)?.max(1);
        let offset = if is_union {
            0
        } else {
            align_up(size, field_align)
        };
        if is_union {
            size = size.max(field_size);
        } else {
            size = offset + field_size;
        }
        align = align.max(field_align);
        fields.push(Field { name, ty, offset });
    }
    Some((fields, align_up(size, align), align))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum StorageClass {
    #[display("auto")]
    Auto,
    #[display("extern")]
    Extern,
    #[display("static")]
    Static,
}

#[derive(Clone, Debug)]
pub struct Var {
    pub name: String,
    pub ty: Type,
    pub is_local: bool,
    pub storage: StorageClass,
    /// Negative displacement from the frame pointer, assigned by the
    /// analyzer; 0 until then (and forever, for globals).
    pub offset: usize,
}

/// One scope frame: the four name spaces opened by a `{`.
#[derive(Default)]
struct Frame {
    vars: Vec<(String, VarId)>,
    typedefs: Vec<(String, Type)>,
    structs: Vec<(String, StructId)>,
    enums: Vec<(String, i64)>,
}

/// The scoped environment plus the program-wide variable and struct arenas.
/// The arenas outlive parsing; AST nodes refer into them by index.
pub struct Env {
    frames: Vec<Frame>,
    pub vars: Vec<Var>,
    pub structs: Vec<StructRecord>,
}

impl Env {
    pub fn new() -> Env {
        Env {
            frames: vec![Frame::default()],
            vars: vec![],
            structs: vec![],
        }
    }

    pub fn enter(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn exit(&mut self) {
        if self.frames.len() == 1 {
            unreachable!("left the file scope");
        }
        self.frames.pop();
    }

    pub fn is_file_scope(&self) -> bool {
        self.frames.len() == 1
    }

    /// Register a variable in the innermost frame. `None` if the frame
    /// already holds one with the same name.
    pub fn define_var(&mut self, name: &str, ty: Type, storage: StorageClass) -> Option<VarId> {
        let frame = self.frames.last_mut().unwrap();
        if frame.vars.iter().any(|(n, _)| n == name) {
            return None;
        }
        let is_local = self.frames.len() > 1 && storage == StorageClass::Auto;
        let id = self.vars.len();
        self.vars.push(Var {
            name: name.to_string(),
            ty,
            is_local,
            storage,
            offset: 0,
        });
        self.frames.last_mut().unwrap().vars.push((name.to_string(), id));
        Some(id)
    }

    pub fn lookup_var(&self, name: &str) -> Option<VarId> {
        for frame in self.frames.iter().rev() {
            if let Some((_, id)) = frame.vars.iter().rev().find(|(n, _)| n == name) {
                return Some(*id);
            }
        }
        None
    }

    pub fn define_typedef(&mut self, name: &str, ty: Type) {
        self.frames
            .last_mut()
            .unwrap()
            .typedefs
            .push((name.to_string(), ty));
    }

    pub fn lookup_typedef(&self, name: &str) -> Option<&Type> {
        for frame in self.frames.iter().rev() {
            if let Some((_, ty)) = frame.typedefs.iter().rev().find(|(n, _)| n == name) {
                return Some(ty);
            }
        }
        None
    }

    pub fn is_typedef_name(&self, name: &str) -> bool {
        self.lookup_typedef(name).is_some()
    }

    /// Look up a struct tag, innermost scope out.
    pub fn lookup_struct(&self, name: &str) -> Option<StructId> {
        for frame in self.frames.iter().rev() {
            if let Some((_, id)) = frame.structs.iter().rev().find(|(n, _)| n == name) {
                return Some(*id);
            }
        }
        None
    }

    /// Find or forward-declare a struct record. Anonymous structs always get
    /// a fresh id.
    pub fn declare_struct(&mut self, name: Option<&str>, is_union: bool) -> StructId {
        if let Some(name) = name {
            if let Some(id) = self.lookup_struct(name) {
                return id;
            }
        }
        let id = self.structs.len();
        self.structs.push(StructRecord {
            name: name.map(str::to_string),
            is_union,
            fields: vec![],
            size: 0,
            align: 1,
            defined: false,
        });
        if let Some(name) = name {
            self.frames
                .last_mut()
                .unwrap()
                .structs
                .push((name.to_string(), id));
        }
        id
    }

    pub fn define_enum_const(&mut self, name: &str, val: i64) {
        self.frames
            .last_mut()
            .unwrap()
            .enums
            .push((name.to_string(), val));
    }

    pub fn lookup_enum_const(&self, name: &str) -> Option<i64> {
        for frame in self.frames.iter().rev() {
            if let Some((_, v)) = frame.enums.iter().rev().find(|(n, _)| n == name) {
                return Some(*v);
            }
        }
        None
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}
