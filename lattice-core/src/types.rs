//! The lattice type system.
//!
//! Tensors are typed by an ordered list of index domains plus a scalar
//! component; sets and elements are nominal. A tensor of order 0 is a scalar,
//! so there is no separate scalar type constructor.

use std::fmt;

/// Scalar component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Int,
    Float,
    Bool,
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKind::Int => write!(f, "int"),
            ScalarKind::Float => write!(f, "float"),
            ScalarKind::Bool => write!(f, "bool"),
        }
    }
}

/// A single index set: a static range `[0,n)` or a user-declared set.
///
/// Equality is structural on ranges and nominal on set names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexSet {
    Range(i64),
    Set(String),
}

impl IndexSet {
    pub fn is_set(&self) -> bool {
        matches!(self, IndexSet::Set(_))
    }
}

impl fmt::Display for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSet::Range(n) => write!(f, "0:{}", n),
            IndexSet::Set(name) => write!(f, "{}", name),
        }
    }
}

/// One tensor dimension: one or more concatenated index sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexDomain {
    pub index_sets: Vec<IndexSet>,
}

impl IndexDomain {
    pub fn new(index_sets: Vec<IndexSet>) -> Self {
        IndexDomain { index_sets }
    }

    pub fn range(n: i64) -> Self {
        IndexDomain { index_sets: vec![IndexSet::Range(n)] }
    }

    pub fn set(name: impl Into<String>) -> Self {
        IndexDomain { index_sets: vec![IndexSet::Set(name.into())] }
    }

    /// Whether any constituent index set is a user-declared set.
    pub fn is_set_domain(&self) -> bool {
        self.index_sets.iter().any(IndexSet::is_set)
    }

    /// Static size, if every constituent set is a range.
    pub fn static_size(&self) -> Option<i64> {
        self.index_sets
            .iter()
            .map(|is| match is {
                IndexSet::Range(n) => Some(*n),
                IndexSet::Set(_) => None,
            })
            .sum()
    }
}

impl fmt::Display for IndexDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.index_sets.iter().map(|is| is.to_string()).collect();
        write!(f, "{}", parts.join("+"))
    }
}

/// A tensor type: ordered index domains over a scalar component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub component: ScalarKind,
    pub dims: Vec<IndexDomain>,
}

impl TensorType {
    pub fn new(component: ScalarKind, dims: Vec<IndexDomain>) -> Self {
        TensorType { component, dims }
    }

    pub fn scalar(component: ScalarKind) -> Self {
        TensorType { component, dims: vec![] }
    }

    pub fn order(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// An element tensor has no set domains.
    pub fn is_element_tensor(&self) -> bool {
        !self.dims.iter().any(IndexDomain::is_set_domain)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scalar() {
            return write!(f, "{}", self.component);
        }
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "tensor[{}]({})", dims.join(","), self.component)
    }
}

/// A named record of tensor-typed fields. Equality is nominal on the name.
#[derive(Debug, Clone, Eq)]
pub struct ElementType {
    pub name: String,
    pub fields: Vec<(String, TensorType)>,
}

impl ElementType {
    pub fn new(name: impl Into<String>, fields: Vec<(String, TensorType)>) -> Self {
        ElementType { name: name.into(), fields }
    }

    pub fn field(&self, name: &str) -> Option<&TensorType> {
        self.fields.iter().find(|(f, _)| f == name).map(|(_, t)| t)
    }
}

impl PartialEq for ElementType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl std::hash::Hash for ElementType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A homogeneous collection of elements; edge sets carry endpoint set names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetType {
    pub element: ElementType,
    /// Endpoint set names; empty for plain vertex sets.
    pub endpoints: Vec<String>,
}

impl SetType {
    pub fn new(element: ElementType) -> Self {
        SetType { element, endpoints: vec![] }
    }

    pub fn edge(element: ElementType, endpoints: Vec<String>) -> Self {
        SetType { element, endpoints }
    }

    pub fn is_edge_set(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Endpoint arity, the cardinality of each edge.
    pub fn arity(&self) -> usize {
        self.endpoints.len()
    }
}

/// Fixed-arity product of elements, used for edge endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleType {
    pub element: ElementType,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Tensor(TensorType),
    Element(ElementType),
    Set(SetType),
    Tuple(TupleType),
}

impl Type {
    pub fn scalar(component: ScalarKind) -> Self {
        Type::Tensor(TensorType::scalar(component))
    }

    pub fn int() -> Self {
        Type::scalar(ScalarKind::Int)
    }

    pub fn float() -> Self {
        Type::scalar(ScalarKind::Float)
    }

    pub fn boolean() -> Self {
        Type::scalar(ScalarKind::Bool)
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Tensor(t) if t.is_scalar())
    }

    pub fn to_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_set(&self) -> Option<&SetType> {
        match self {
            Type::Set(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor(t) => write!(f, "{}", t),
            Type::Element(e) => write!(f, "{}", e.name),
            Type::Set(s) => {
                write!(f, "set{{{}}}", s.element.name)?;
                if s.is_edge_set() {
                    write!(f, "({})", s.endpoints.join(","))?;
                }
                Ok(())
            }
            Type::Tuple(t) => write!(f, "({}*{})", t.element.name, t.size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_is_order_zero_tensor() {
        let t = TensorType::scalar(ScalarKind::Float);
        assert_eq!(t.order(), 0);
        assert!(t.is_scalar());
        assert!(t.is_element_tensor());
    }

    #[test]
    fn element_tensor_has_no_set_domains() {
        let elem = TensorType::new(
            ScalarKind::Float,
            vec![IndexDomain::range(3), IndexDomain::range(3)],
        );
        assert!(elem.is_element_tensor());

        let system = TensorType::new(
            ScalarKind::Float,
            vec![IndexDomain::set("V"), IndexDomain::set("V")],
        );
        assert!(!system.is_element_tensor());
        assert_eq!(system.order(), 2);
    }

    #[test]
    fn element_equality_is_nominal() {
        let a = ElementType::new("Point", vec![("x".into(), TensorType::scalar(ScalarKind::Float))]);
        let b = ElementType::new("Point", vec![]);
        assert_eq!(a, b);

        let c = ElementType::new("Quad", vec![]);
        assert_ne!(a, c);
    }

    #[test]
    fn range_equality_is_structural() {
        assert_eq!(IndexSet::Range(4), IndexSet::Range(4));
        assert_ne!(IndexSet::Range(4), IndexSet::Range(5));
        assert_eq!(IndexSet::Set("V".into()), IndexSet::Set("V".into()));
    }
}
