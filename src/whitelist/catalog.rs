//=====================================================
// File: whitelist/catalog.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Registry of the types a script can touch
// Objective: Describe built-in intrinsics and host-registered types so
//            whitelist entries can be validated and member results typed
//=====================================================

use super::{ConfigurationError, MemberKind};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Pseudo owner type of the built-in global functions (`len`, `str`, ...).
pub const GLOBAL_TYPE: &str = "Global";

static INTRINSICS: Lazy<HashMap<String, HostType>> = Lazy::new(|| {
    intrinsic_types()
        .into_iter()
        .map(|ty| (ty.name.clone(), ty))
        .collect()
});

/// One member of a [`HostType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMember {
    pub name: String,
    pub kind: MemberKind,
    /// Static result type, when the member always yields the same type.
    pub result: Option<String>,
}

/// Descriptor of a type whose values scripts can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostType {
    pub name: String,
    pub members: Vec<HostMember>,
}

impl HostType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn method(self, name: &str, result: Option<&str>) -> Self {
        self.member(name, MemberKind::Method, result)
    }

    pub fn property(self, name: &str, result: Option<&str>) -> Self {
        self.member(name, MemberKind::Property, result)
    }

    fn member(mut self, name: &str, kind: MemberKind, result: Option<&str>) -> Self {
        self.members.push(HostMember {
            name: name.to_string(),
            kind,
            result: result.map(str::to_string),
        });
        self
    }

    pub fn find(&self, name: &str, kind: MemberKind) -> Option<&HostMember> {
        self.members
            .iter()
            .find(|member| member.name == name && member.kind == kind)
    }

    fn has_member_named(&self, name: &str) -> bool {
        self.members.iter().any(|member| member.name == name)
    }
}

/// Known types and their members.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: HashMap<String, HostType>,
}

impl TypeCatalog {
    /// Catalog with no types at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the interpreter's intrinsic types.
    pub fn builtin() -> Self {
        Self {
            types: (*INTRINSICS).clone(),
        }
    }

    pub fn register(&mut self, ty: HostType) -> Result<(), ConfigurationError> {
        if self.types.contains_key(&ty.name) {
            return Err(ConfigurationError::DuplicateType { name: ty.name });
        }
        self.types.insert(ty.name.clone(), ty);
        Ok(())
    }

    pub fn with_type(mut self, ty: HostType) -> Result<Self, ConfigurationError> {
        self.register(ty)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&HostType> {
        self.types.get(name)
    }

    pub fn contains_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Check that `(owner, member, kind)` names something real.
    pub fn validate(
        &self,
        owner: &str,
        member: &str,
        kind: MemberKind,
    ) -> Result<(), ConfigurationError> {
        let ty = self
            .types
            .get(owner)
            .ok_or_else(|| ConfigurationError::UnknownType {
                owner: owner.to_string(),
            })?;

        if ty.find(member, kind).is_some() {
            return Ok(());
        }
        if ty.has_member_named(member) {
            return Err(ConfigurationError::KindMismatch {
                owner: owner.to_string(),
                member: member.to_string(),
                kind,
            });
        }
        Err(ConfigurationError::UnknownMember {
            owner: owner.to_string(),
            member: member.to_string(),
        })
    }

    pub fn result_type(&self, owner: &str, member: &str, kind: MemberKind) -> Option<&str> {
        self.types
            .get(owner)?
            .find(member, kind)?
            .result
            .as_deref()
    }
}

fn intrinsic_types() -> Vec<HostType> {
    vec![
        HostType::new("String")
            .method("length", Some("Int"))
            .method("upper", Some("String"))
            .method("lower", Some("String"))
            .method("trim", Some("String"))
            .method("contains", Some("Bool"))
            .method("startsWith", Some("Bool"))
            .method("endsWith", Some("Bool"))
            .method("split", Some("Array"))
            .method("replace", Some("String"))
            .method("toInt", Some("Int")),
        HostType::new("Array")
            .method("size", Some("Int"))
            .method("get", None)
            .method("push", Some("Null"))
            .method("contains", Some("Bool"))
            .method("join", Some("String"))
            .method("isEmpty", Some("Bool"))
            .property("length", Some("Int")),
        HostType::new("Map")
            .method("get", None)
            .method("put", None)
            .method("containsKey", Some("Bool"))
            .method("keys", Some("Array"))
            .method("size", Some("Int")),
        HostType::new("Int")
            .method("abs", Some("Int"))
            .method("toString", Some("String"))
            .method("toFloat", Some("Float")),
        HostType::new("Float")
            .method("abs", Some("Float"))
            .method("toString", Some("String")),
        HostType::new("Bool"),
        HostType::new("Function"),
        HostType::new("Null"),
        HostType::new(GLOBAL_TYPE)
            .method("len", Some("Int"))
            .method("str", Some("String"))
            .method("int", Some("Int"))
            .method("float", Some("Float"))
            .method("range", Some("Array"))
            .method("typeOf", Some("String")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_knows_intrinsics() {
        let catalog = TypeCatalog::builtin();
        assert!(catalog.validate("String", "upper", MemberKind::Method).is_ok());
        assert!(catalog.validate("Array", "length", MemberKind::Property).is_ok());
        assert_eq!(
            catalog.result_type(GLOBAL_TYPE, "range", MemberKind::Method),
            Some("Array")
        );
        assert_eq!(catalog.result_type("Array", "get", MemberKind::Method), None);
    }

    #[test]
    fn validate_distinguishes_failures() {
        let catalog = TypeCatalog::builtin();
        assert!(matches!(
            catalog.validate("Socket", "open", MemberKind::Method),
            Err(ConfigurationError::UnknownType { .. })
        ));
        assert!(matches!(
            catalog.validate("String", "explode", MemberKind::Method),
            Err(ConfigurationError::UnknownMember { .. })
        ));
        assert!(matches!(
            catalog.validate("Array", "length", MemberKind::Method),
            Err(ConfigurationError::KindMismatch { .. })
        ));
    }

    #[test]
    fn host_types_register_once() {
        let queue = HostType::new("Queue")
            .method("add", None)
            .property("title", Some("String"));
        let mut catalog = TypeCatalog::builtin().with_type(queue.clone()).expect("register");
        assert!(catalog.contains_type("Queue"));
        assert!(matches!(
            catalog.register(queue),
            Err(ConfigurationError::DuplicateType { .. })
        ));
    }
}

//=====================================================
// End of file
//=====================================================
