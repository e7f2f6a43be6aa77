use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use super::chunk::Function;
use super::error::ValueError;
use super::table::{hash_bytes, Key};

/// Capacity policy shared by every growable buffer: double, with a floor of 8.
pub(crate) fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

/// Element type tag of an [`Array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementType {
    Int,
    Float,
    Char,
    Bool,
    Key,
    Function,
    /// A literal under construction, or an empty array nobody typed.
    Unknown,
}

impl ElementType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "integer",
            Self::Float => "float",
            Self::Char => "character",
            Self::Bool => "boolean",
            Self::Key => "key",
            Self::Function => "function",
            Self::Unknown => "untyped",
        })
    }
}

/// A single element, used when growing an array one value at a time.
#[derive(Debug, Clone)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Char(u8),
    Bool(bool),
    Key(Rc<Key>),
    Function(Rc<Function>),
}

impl Scalar {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Int(_) => ElementType::Int,
            Self::Float(_) => ElementType::Float,
            Self::Char(_) => ElementType::Char,
            Self::Bool(_) => ElementType::Bool,
            Self::Key(_) => ElementType::Key,
            Self::Function(_) => ElementType::Function,
        }
    }

    /// Zero, NUL, `false` and the empty key are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Char(c) => *c != 0,
            Self::Bool(b) => *b,
            Self::Key(k) => !k.is_empty(),
            Self::Function(_) => true,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Char(c) => write!(f, "{}", char::from(*c)),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Key(k) => write!(f, "{k}"),
            Self::Function(func) => write!(f, "{func}"),
        }
    }
}

/// Typed backing storage. The variant *is* the element type, so the tag can
/// never disagree with the payload.
#[derive(Debug, Clone)]
pub enum Elements {
    Unknown,
    Int(Vec<i64>),
    Float(Vec<f64>),
    Char(Vec<u8>),
    Bool(Vec<bool>),
    Key(Vec<Rc<Key>>),
    Function(Vec<Rc<Function>>),
}

impl Elements {
    fn empty(ty: ElementType) -> Self {
        match ty {
            ElementType::Int => Self::Int(Vec::new()),
            ElementType::Float => Self::Float(Vec::new()),
            ElementType::Char => Self::Char(Vec::new()),
            ElementType::Bool => Self::Bool(Vec::new()),
            ElementType::Key => Self::Key(Vec::new()),
            ElementType::Function => Self::Function(Vec::new()),
            ElementType::Unknown => Self::Unknown,
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Unknown => ElementType::Unknown,
            Self::Int(_) => ElementType::Int,
            Self::Float(_) => ElementType::Float,
            Self::Char(_) => ElementType::Char,
            Self::Bool(_) => ElementType::Bool,
            Self::Key(_) => ElementType::Key,
            Self::Function(_) => ElementType::Function,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Key(v) => v.len(),
            Self::Function(v) => v.len(),
        }
    }

    fn reserve_exact(&mut self, additional: usize) {
        match self {
            Self::Unknown => {}
            Self::Int(v) => v.reserve_exact(additional),
            Self::Float(v) => v.reserve_exact(additional),
            Self::Char(v) => v.reserve_exact(additional),
            Self::Bool(v) => v.reserve_exact(additional),
            Self::Key(v) => v.reserve_exact(additional),
            Self::Function(v) => v.reserve_exact(additional),
        }
    }

    fn get(&self, index: usize) -> Option<Scalar> {
        match self {
            Self::Unknown => None,
            Self::Int(v) => v.get(index).copied().map(Scalar::Int),
            Self::Float(v) => v.get(index).copied().map(Scalar::Float),
            Self::Char(v) => v.get(index).copied().map(Scalar::Char),
            Self::Bool(v) => v.get(index).copied().map(Scalar::Bool),
            Self::Key(v) => v.get(index).cloned().map(Scalar::Key),
            Self::Function(v) => v.get(index).cloned().map(Scalar::Function),
        }
    }
}

/// The sole runtime value: an N-dimensional, homogeneously typed array stored
/// flat in row-major order.
#[derive(Debug, Clone)]
pub struct Array {
    elements: Elements,
    dims: Vec<usize>,
    capacity: usize,
    /// Lazily computed hash of a character array's text.
    hash: Cell<Option<u32>>,
}

impl Array {
    /// An empty array of the given element type with no dimensions yet.
    pub fn new(ty: ElementType) -> Self {
        Self {
            elements: Elements::empty(ty),
            dims: Vec::new(),
            capacity: 0,
            hash: Cell::new(None),
        }
    }

    /// The untyped zero-length vector: `[]`, uninitialised variables and
    /// implicit function results.
    pub fn empty() -> Self {
        Self::from_parts(Elements::Unknown, vec![0])
    }

    fn from_parts(elements: Elements, dims: Vec<usize>) -> Self {
        let capacity = elements.len();
        Self {
            elements,
            dims,
            capacity,
            hash: Cell::new(None),
        }
    }

    fn vector(elements: Elements) -> Self {
        let len = elements.len();
        Self::from_parts(elements, vec![len])
    }

    pub fn ints(values: Vec<i64>) -> Self {
        Self::vector(Elements::Int(values))
    }

    pub fn floats(values: Vec<f64>) -> Self {
        Self::vector(Elements::Float(values))
    }

    pub fn bools(values: Vec<bool>) -> Self {
        Self::vector(Elements::Bool(values))
    }

    pub fn chars(text: &str) -> Self {
        Self::vector(Elements::Char(text.as_bytes().to_vec()))
    }

    pub fn key(key: Rc<Key>) -> Self {
        Self::vector(Elements::Key(vec![key]))
    }

    pub fn function(function: Rc<Function>) -> Self {
        Self::vector(Elements::Function(vec![function]))
    }

    /// Reinterpret the flat buffer under new dimensions.
    pub fn reshaped(mut self, dims: Vec<usize>) -> Result<Self, ValueError> {
        if dims.iter().product::<usize>() != self.count() {
            return Err(ValueError::ShapeMismatch {
                left: self.dims,
                right: dims,
            });
        }
        self.dims = dims;
        Ok(self)
    }

    pub fn element_type(&self) -> ElementType {
        self.elements.element_type()
    }

    pub fn elements(&self) -> &Elements {
        &self.elements
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements currently stored.
    pub fn count(&self) -> usize {
        self.elements.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, index: usize) -> Option<Scalar> {
        self.elements.get(index)
    }

    /// The single function held by a callable array.
    pub fn as_function(&self) -> Option<&Rc<Function>> {
        match &self.elements {
            Elements::Function(funcs) if funcs.len() == 1 => funcs.first(),
            _ => None,
        }
    }

    /// The single key held by a key array.
    pub fn as_key(&self) -> Option<&Rc<Key>> {
        match &self.elements {
            Elements::Key(keys) if keys.len() == 1 => keys.first(),
            _ => None,
        }
    }

    /// Hash of a character array's text, computed on first use.
    pub fn text_hash(&self) -> Option<u32> {
        let Elements::Char(bytes) = &self.elements else {
            return None;
        };
        if let Some(hash) = self.hash.get() {
            return Some(hash);
        }
        let hash = hash_bytes(bytes);
        self.hash.set(Some(hash));
        Some(hash)
    }

    /// Append one element. The first element fixes an untyped array's type.
    /// With `grow_dimension` the innermost axis is extended by one.
    pub fn push(&mut self, value: Scalar, grow_dimension: bool) -> Result<(), ValueError> {
        if let Elements::Unknown = self.elements {
            self.elements = Elements::empty(value.element_type());
        }
        let count = self.count();
        if count + 1 > self.capacity {
            let capacity = grow_capacity(self.capacity);
            self.elements.reserve_exact(capacity - count);
            self.capacity = capacity;
        }
        match (&mut self.elements, value) {
            (Elements::Int(v), Scalar::Int(x)) => v.push(x),
            (Elements::Float(v), Scalar::Float(x)) => v.push(x),
            (Elements::Char(v), Scalar::Char(x)) => v.push(x),
            (Elements::Bool(v), Scalar::Bool(x)) => v.push(x),
            (Elements::Key(v), Scalar::Key(x)) => v.push(x),
            (Elements::Function(v), Scalar::Function(x)) => v.push(x),
            (elements, value) => {
                return Err(ValueError::TypeMismatch {
                    expected: elements.element_type(),
                    found: value.element_type(),
                });
            }
        }
        self.hash.set(None);
        if grow_dimension {
            match self.dims.last_mut() {
                Some(last) => *last += 1,
                None => self.dims.push(1),
            }
        }
        Ok(())
    }

    /// Add `axis_delta` to the extent of `axis_index`, creating zero-extent
    /// axes up to it when needed.
    pub fn set_dimension(&mut self, axis_delta: usize, axis_index: usize) {
        if self.dims.len() <= axis_index {
            self.dims.resize(axis_index + 1, 0);
        }
        self.dims[axis_index] += axis_delta;
    }

    /// Convert an integer array to float in place. Other types are untouched.
    pub fn promote_to_float(&mut self) {
        if let Elements::Int(values) = &self.elements {
            #[allow(clippy::cast_precision_loss)]
            let floats = values.iter().map(|&v| v as f64).collect();
            self.elements = Elements::Float(floats);
        }
    }

    /// Truthiness of a single-element array.
    pub fn truthiness(&self) -> Result<bool, ValueError> {
        if self.count() != 1 {
            return Err(ValueError::NotSingle(self.count()));
        }
        self.get(0).map(|s| s.is_truthy()).ok_or(ValueError::Untyped)
    }

    pub fn negate(&self) -> Result<Array, ValueError> {
        let elements = match &self.elements {
            Elements::Int(v) => Elements::Int(v.iter().map(|x| x.wrapping_neg()).collect()),
            Elements::Float(v) => Elements::Float(v.iter().map(|x| -x).collect()),
            Elements::Unknown => return Err(ValueError::Untyped),
            other => {
                return Err(ValueError::Unsupported {
                    op: "-",
                    ty: other.element_type(),
                })
            }
        };
        Ok(Self::from_parts(elements, self.dims.clone()))
    }

    pub fn not(&self) -> Result<Array, ValueError> {
        match &self.elements {
            Elements::Bool(v) => Ok(Self::from_parts(
                Elements::Bool(v.iter().map(|b| !b).collect()),
                self.dims.clone(),
            )),
            Elements::Unknown => Err(ValueError::Untyped),
            other => Err(ValueError::Unsupported {
                op: "!",
                ty: other.element_type(),
            }),
        }
    }

    /// The dimensions as an integer vector.
    pub fn dims_array(&self) -> Array {
        let mut out = Array::new(ElementType::Int);
        out.set_dimension(0, 0);
        for &extent in &self.dims {
            let extent = i64::try_from(extent).unwrap_or(i64::MAX);
            // An integer array always accepts an integer.
            let _ = out.push(Scalar::Int(extent), true);
        }
        out
    }

    /// Collapse the final axis by summation. Rank 0 and 1 reduce to a single
    /// element with dims `[1]`.
    pub fn reduce_last_axis(&self) -> Result<Array, ValueError> {
        let (outer_dims, inner) = match self.dims.split_last() {
            Some((&inner, outer)) if !outer.is_empty() => (outer.to_vec(), inner),
            _ => (vec![1], self.count()),
        };
        let outer: usize = outer_dims.iter().product();
        let elements = match &self.elements {
            Elements::Int(v) => Elements::Int(
                (0..outer)
                    .map(|row| {
                        v[row * inner..(row + 1) * inner]
                            .iter()
                            .fold(0i64, |acc, x| acc.wrapping_add(*x))
                    })
                    .collect(),
            ),
            Elements::Float(v) => Elements::Float(
                (0..outer)
                    .map(|row| v[row * inner..(row + 1) * inner].iter().sum())
                    .collect(),
            ),
            Elements::Unknown => return Err(ValueError::Untyped),
            other => return Err(ValueError::NotNumeric(other.element_type())),
        };
        Ok(Self::from_parts(elements, outer_dims))
    }

    pub fn all(&self) -> Result<Array, ValueError> {
        self.reduce_truthiness(true)
    }

    pub fn any(&self) -> Result<Array, ValueError> {
        self.reduce_truthiness(false)
    }

    /// `every` selects all-truthy, otherwise any-truthy.
    fn reduce_truthiness(&self, every: bool) -> Result<Array, ValueError> {
        if let Elements::Unknown = self.elements {
            return Err(ValueError::Untyped);
        }
        let mut values = (0..self.count()).filter_map(|i| self.get(i));
        let result = if every {
            values.all(|s| s.is_truthy())
        } else {
            values.any(|s| s.is_truthy())
        };
        Ok(Array::bools(vec![result]))
    }

    /// `result[i] = self[indices[i]]`, indexing the flat buffer.
    pub fn gather(&self, indices: &Array) -> Result<Array, ValueError> {
        if let Elements::Unknown = self.elements {
            return Err(ValueError::Untyped);
        }
        let positions = indices.to_positions(self.count())?;
        let mut out = Array::new(self.element_type());
        out.set_dimension(0, 0);
        for position in positions {
            let value = self.get(position).ok_or(ValueError::IndexOutOfRange {
                index: i64::try_from(position).unwrap_or(i64::MAX),
                count: self.count(),
            })?;
            out.push(value, true)?;
        }
        Ok(out)
    }

    /// Coerce an index array to in-range flat positions.
    fn to_positions(&self, count: usize) -> Result<Vec<usize>, ValueError> {
        let check = |index: i64| {
            usize::try_from(index)
                .ok()
                .filter(|&i| i < count)
                .ok_or(ValueError::IndexOutOfRange { index, count })
        };
        match &self.elements {
            Elements::Int(v) => v.iter().map(|&i| check(i)).collect(),
            #[allow(clippy::cast_possible_truncation)]
            Elements::Float(v) => v
                .iter()
                .map(|&f| {
                    if f.fract() != 0.0 || !f.is_finite() {
                        Err(ValueError::FractionalIndex(f))
                    } else {
                        check(f as i64)
                    }
                })
                .collect(),
            Elements::Bool(v) => v.iter().map(|&b| check(i64::from(b))).collect(),
            Elements::Unknown => Err(ValueError::Untyped),
            other => Err(ValueError::NotNumeric(other.element_type())),
        }
    }

    fn fmt_axis(&self, f: &mut fmt::Formatter<'_>, axis: usize, mut offset: usize) -> Result<usize, fmt::Error> {
        let extent = self.dims[axis];
        f.write_str("[")?;
        if axis + 1 == self.dims.len() {
            if let Elements::Char(bytes) = &self.elements {
                // A row is UTF-8 text; multi-byte characters span several elements.
                let row = bytes.get(offset..offset + extent).unwrap_or_default();
                f.write_str(&String::from_utf8_lossy(row))?;
            } else {
                for i in 0..extent {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    if let Some(value) = self.get(offset + i) {
                        write!(f, "{value}")?;
                    }
                }
            }
            offset += extent;
        } else {
            for i in 0..extent {
                if i > 0 {
                    f.write_str(",")?;
                }
                offset = self.fmt_axis(f, axis + 1, offset)?;
            }
        }
        f.write_str("]")?;
        Ok(offset)
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(function) = self.as_function() {
            return write!(f, "{function}");
        }
        if self.dims.is_empty() {
            return match self.get(0) {
                Some(value) => write!(f, "[{value}]"),
                None => f.write_str("[]"),
            };
        }
        self.fmt_axis(f, 0, 0).map(|_| ())
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        if self.dims != other.dims {
            return false;
        }
        if let (Some(a), Some(b)) = (self.text_hash(), other.text_hash()) {
            if a != b {
                return false;
            }
        }
        match (&self.elements, &other.elements) {
            (Elements::Unknown, Elements::Unknown) => true,
            (Elements::Int(a), Elements::Int(b)) => a == b,
            (Elements::Float(a), Elements::Float(b)) => a == b,
            (Elements::Char(a), Elements::Char(b)) => a == b,
            (Elements::Bool(a), Elements::Bool(b)) => a == b,
            (Elements::Key(a), Elements::Key(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Rc::ptr_eq(x, y))
            }
            (Elements::Function(a), Elements::Function(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Rc::ptr_eq(x, y))
            }
            _ => false,
        }
    }
}

// ── Broadcasting ────────────────────────────────────────────────

/// How the elements of two operands pair up in a binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    /// Identical dims, element i pairs with element i.
    OneToOne,
    /// The left operand has one element; the result takes the right dims.
    LeftScalar,
    /// The right operand has one element; the result takes the left dims.
    RightScalar,
    Mismatch,
}

pub fn broadcast_classify(a: &Array, b: &Array) -> Broadcast {
    if a.dims == b.dims {
        Broadcast::OneToOne
    } else if a.count() == 1 {
        Broadcast::LeftScalar
    } else if b.count() == 1 {
        Broadcast::RightScalar
    } else {
        Broadcast::Mismatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    Less,
    Greater,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Equal => "==",
            Self::Less => "<",
            Self::Greater => ">",
        }
    }
}

/// Index pairing for a classified operation.
struct Pairing {
    len: usize,
    left_scalar: bool,
    right_scalar: bool,
}

impl Pairing {
    fn map<T, U, R>(&self, a: &[T], b: &[U], f: impl Fn(&T, &U) -> R) -> Vec<R> {
        (0..self.len)
            .map(|i| {
                let x = &a[if self.left_scalar { 0 } else { i }];
                let y = &b[if self.right_scalar { 0 } else { i }];
                f(x, y)
            })
            .collect()
    }
}

enum Numeric<'a> {
    Int(&'a [i64]),
    Float(&'a [f64]),
}

fn numeric(array: &Array) -> Result<Numeric<'_>, ValueError> {
    match &array.elements {
        Elements::Int(v) => Ok(Numeric::Int(v)),
        Elements::Float(v) => Ok(Numeric::Float(v)),
        Elements::Unknown => Err(ValueError::Untyped),
        other => Err(ValueError::NotNumeric(other.element_type())),
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_floats(values: Numeric<'_>) -> Vec<f64> {
    match values {
        Numeric::Int(v) => v.iter().map(|&x| x as f64).collect(),
        Numeric::Float(v) => v.to_vec(),
    }
}

/// Apply `op` elementwise under the broadcast rule. The result carries the
/// broadcast dims.
pub fn elementwise_apply(a: &Array, b: &Array, op: BinaryOp) -> Result<Array, ValueError> {
    let mode = broadcast_classify(a, b);
    let dims = match mode {
        Broadcast::OneToOne | Broadcast::RightScalar => a.dims.clone(),
        Broadcast::LeftScalar => b.dims.clone(),
        Broadcast::Mismatch => {
            return Err(ValueError::ShapeMismatch {
                left: a.dims.clone(),
                right: b.dims.clone(),
            })
        }
    };
    let pairing = Pairing {
        len: dims.iter().product(),
        left_scalar: mode == Broadcast::LeftScalar,
        right_scalar: mode == Broadcast::RightScalar,
    };
    let elements = match op {
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
            arithmetic(&pairing, numeric(a)?, numeric(b)?, op)
        }
        BinaryOp::Equal | BinaryOp::Less | BinaryOp::Greater => compare(&pairing, a, b, op)?,
    };
    Ok(Array::from_parts(elements, dims))
}

fn arithmetic(pairing: &Pairing, a: Numeric<'_>, b: Numeric<'_>, op: BinaryOp) -> Elements {
    if let (Numeric::Int(x), Numeric::Int(y), false) = (&a, &b, op == BinaryOp::Divide) {
        let f = match op {
            BinaryOp::Add => i64::wrapping_add,
            BinaryOp::Subtract => i64::wrapping_sub,
            _ => i64::wrapping_mul,
        };
        return Elements::Int(pairing.map(*x, *y, |l, r| f(*l, *r)));
    }
    let (x, y) = (to_floats(a), to_floats(b));
    Elements::Float(pairing.map(&x, &y, |l, r| match op {
        BinaryOp::Add => l + r,
        BinaryOp::Subtract => l - r,
        BinaryOp::Multiply => l * r,
        _ => l / r,
    }))
}

fn compare(pairing: &Pairing, a: &Array, b: &Array, op: BinaryOp) -> Result<Elements, ValueError> {
    fn ordered<T: PartialOrd>(op: BinaryOp) -> impl Fn(&T, &T) -> bool {
        move |l, r| match op {
            BinaryOp::Equal => l == r,
            BinaryOp::Less => l < r,
            _ => l > r,
        }
    }
    let result = match (&a.elements, &b.elements) {
        (Elements::Unknown, _) | (_, Elements::Unknown) => return Err(ValueError::Untyped),
        (Elements::Int(x), Elements::Int(y)) => pairing.map(x, y, ordered(op)),
        (Elements::Char(x), Elements::Char(y)) => pairing.map(x, y, ordered(op)),
        (Elements::Bool(x), Elements::Bool(y)) => pairing.map(x, y, ordered(op)),
        (Elements::Key(x), Elements::Key(y)) if op == BinaryOp::Equal => {
            pairing.map(x, y, |l, r| Rc::ptr_eq(l, r))
        }
        (Elements::Key(_) | Elements::Function(_), _) => {
            return Err(ValueError::Unsupported {
                op: op.symbol(),
                ty: a.element_type(),
            })
        }
        _ if a.element_type().is_numeric() && b.element_type().is_numeric() => {
            let (x, y) = (to_floats(numeric(a)?), to_floats(numeric(b)?));
            pairing.map(&x, &y, ordered(op))
        }
        _ => {
            return Err(ValueError::Incomparable {
                left: a.element_type(),
                right: b.element_type(),
            })
        }
    };
    Ok(Elements::Bool(result))
}

/// Elementwise multiply followed by a last-axis sum.
pub fn dot_product(a: &Array, b: &Array) -> Result<Array, ValueError> {
    elementwise_apply(a, b, BinaryOp::Multiply)?.reduce_last_axis()
}
