//! Base implementation of records.
//!
//! A [`Record`] is either a single [`Tensor`], a named tree of records, a list
//! of items, an opaque [`Value`] or a lazily stacked view. The tree utilities
//! defined here ([`Record::flatten`], [`Record::unflatten`],
//! [`Record::unbind`], [`Record::stack`]) are shared by every storage.
use super::{LazyStackedRecord, Tensor};
use crate::error::StorageError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Opaque, non-array value carried through storages as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A text value.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Path of a field in a record tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// The path of the root of a record.
    pub fn root() -> Self {
        Self(vec![])
    }

    /// Builds a path from its components.
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// The path of a child field.
    pub fn child(&self, name: &str) -> Self {
        let mut names = self.0.clone();
        names.push(name.to_string());
        Self(names)
    }

    /// Components of the path.
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Returns `true` for the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Relative file path of the leaf, with the given extension.
    ///
    /// The root leaf of a flat record maps to `tensor.<ext>`.
    pub fn to_file_path(&self, ext: &str) -> PathBuf {
        let (last, parents) = match self.0.split_last() {
            Some(split) => split,
            None => return PathBuf::from(format!("tensor.{}", ext)),
        };
        let mut path: PathBuf = parents.iter().collect();
        path.push(format!("{}.{}", last, ext));
        path
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        Self::new(s.split('.').filter(|n| !n.is_empty()))
    }
}

/// Insertion-ordered named fields of a structured record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields(Vec<(String, Record)>);

impl Fields {
    /// Empty set of fields.
    pub fn new() -> Self {
        Self(vec![])
    }

    /// Inserts a field, replacing an existing field of the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, value: Record) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name, value)),
        }
    }

    /// Gets a field.
    pub fn get(&self, name: &str) -> Option<&Record> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Names of the fields.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(k, _)| k)
    }

    /// Iterates over the fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there is no field.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Fields {
    type Item = (String, Record);
    type IntoIter = std::vec::IntoIter<(String, Record)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Record)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, Record)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        iter.into_iter().for_each(|(k, v)| fields.insert(k, v));
        fields
    }
}

/// Structure of a record tree without its array data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeSpec {
    /// A tensor leaf.
    Leaf,
    /// Named sub-trees.
    Struct(Vec<(String, TreeSpec)>),
    /// A non-array value, kept in the structure itself.
    Value(Value),
}

impl TreeSpec {
    /// Number of tensor leaves.
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Struct(fields) => fields.iter().map(|(_, s)| s.num_leaves()).sum(),
            TreeSpec::Value(_) => 0,
        }
    }

    /// Returns `true` if the tree holds non-array values.
    pub fn has_values(&self) -> bool {
        match self {
            TreeSpec::Leaf => false,
            TreeSpec::Struct(fields) => fields.iter().any(|(_, s)| s.has_values()),
            TreeSpec::Value(_) => true,
        }
    }

    /// Paths of the tensor leaves, in flatten order.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = vec![];
        self.collect_paths(&FieldPath::root(), &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &FieldPath, out: &mut Vec<FieldPath>) {
        match self {
            TreeSpec::Leaf => out.push(prefix.clone()),
            TreeSpec::Struct(fields) => fields
                .iter()
                .for_each(|(k, s)| s.collect_paths(&prefix.child(k), out)),
            TreeSpec::Value(_) => {}
        }
    }
}

/// A logical item written to or read from a storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// A single array.
    Tensor(Tensor),
    /// Named fields, possibly nested.
    Struct(Fields),
    /// A sequence of items.
    List(Vec<Record>),
    /// An opaque non-array value.
    Value(Value),
    /// Items stacked lazily along an axis.
    Stacked(LazyStackedRecord),
}

impl From<Tensor> for Record {
    fn from(t: Tensor) -> Self {
        Record::Tensor(t)
    }
}

impl From<Value> for Record {
    fn from(v: Value) -> Self {
        Record::Value(v)
    }
}

impl From<Fields> for Record {
    fn from(f: Fields) -> Self {
        Record::Struct(f)
    }
}

impl From<LazyStackedRecord> for Record {
    fn from(s: LazyStackedRecord) -> Self {
        Record::Stacked(s)
    }
}

fn type_error(msg: String) -> anyhow::Error {
    StorageError::Type(msg).into()
}

impl Record {
    /// Builds a structured record from named fields.
    pub fn from_fields<K: Into<String>>(fields: impl IntoIterator<Item = (K, Record)>) -> Self {
        Record::Struct(fields.into_iter().collect())
    }

    /// Short name of the variant, used in messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Tensor(_) => "tensor",
            Record::Struct(_) => "struct",
            Record::List(_) => "list",
            Record::Value(_) => "value",
            Record::Stacked(_) => "lazy stack",
        }
    }

    /// The tensor, if the record is flat.
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Record::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// The items, if the record is a list.
    pub fn as_list(&self) -> Option<&[Record]> {
        match self {
            Record::List(items) => Some(items),
            _ => None,
        }
    }

    /// The lazy stack, if the record is one.
    pub fn as_stacked(&self) -> Option<&LazyStackedRecord> {
        match self {
            Record::Stacked(s) => Some(s),
            _ => None,
        }
    }

    /// Gets a direct field of a structured record.
    pub fn field(&self, name: &str) -> Option<&Record> {
        match self {
            Record::Struct(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Gets a nested field.
    pub fn get_path(&self, path: &FieldPath) -> Option<&Record> {
        path.names()
            .iter()
            .try_fold(self, |record, name| record.field(name))
    }

    /// Tensor leaves with their paths, in flatten order.
    pub fn leaves(&self) -> Vec<(FieldPath, &Tensor)> {
        let mut out = vec![];
        self.collect_leaves(FieldPath::root(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, path: FieldPath, out: &mut Vec<(FieldPath, &'a Tensor)>) {
        match self {
            Record::Tensor(t) => out.push((path, t)),
            Record::Struct(fields) => fields
                .iter()
                .for_each(|(k, v)| v.collect_leaves(path.child(k), out)),
            _ => {}
        }
    }

    /// Shape shared by the leading axes of every item of the record.
    ///
    /// For a structured record this is the longest common prefix of the
    /// shapes of its tensor leaves.
    pub fn batch_shape(&self) -> Vec<usize> {
        match self {
            Record::Tensor(t) => t.shape().to_vec(),
            Record::Struct(_) => {
                let leaves = self.leaves();
                let mut iter = leaves.iter();
                let mut prefix = match iter.next() {
                    Some((_, t)) => t.shape().to_vec(),
                    None => return vec![],
                };
                for (_, t) in iter {
                    let n = prefix
                        .iter()
                        .zip(t.shape().iter())
                        .take_while(|(a, b)| a == b)
                        .count();
                    prefix.truncate(n);
                }
                prefix
            }
            Record::List(items) => vec![items.len()],
            Record::Value(_) => vec![],
            Record::Stacked(s) => s.batch_shape(),
        }
    }

    /// Number of batch dimensions.
    pub fn ndim(&self) -> usize {
        self.batch_shape().len()
    }

    /// Applies `f` to every tensor leaf, keeping the tree structure.
    pub fn map_tensors<F>(&self, f: &mut F) -> Result<Record>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        Ok(match self {
            Record::Tensor(t) => Record::Tensor(f(t)?),
            Record::Struct(fields) => Record::Struct(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.map_tensors(f)?)))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .collect(),
            ),
            Record::List(items) => Record::List(
                items
                    .iter()
                    .map(|v| v.map_tensors(f))
                    .collect::<Result<_>>()?,
            ),
            Record::Value(v) => Record::Value(v.clone()),
            Record::Stacked(s) => Record::Stacked(LazyStackedRecord::new(
                s.items()
                    .iter()
                    .map(|v| v.map_tensors(f))
                    .collect::<Result<_>>()?,
                s.stack_dim(),
            )?),
        })
    }

    /// Re-tags every tensor leaf with `device`.
    pub fn to_device(&self, device: &crate::record::Device) -> Record {
        self.map_tensors(&mut |t| Ok(t.to_device(device)))
            .unwrap_or_else(|_| self.clone())
    }

    /// Splits a tensor tree into its leaves and structure.
    pub fn flatten(&self) -> Result<(Vec<Tensor>, TreeSpec)> {
        let mut leaves = vec![];
        let spec = self.flatten_into(&mut leaves)?;
        Ok((leaves, spec))
    }

    fn flatten_into(&self, leaves: &mut Vec<Tensor>) -> Result<TreeSpec> {
        match self {
            Record::Tensor(t) => {
                leaves.push(t.clone());
                Ok(TreeSpec::Leaf)
            }
            Record::Struct(fields) => Ok(TreeSpec::Struct(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.flatten_into(leaves)?)))
                    .collect::<Result<_>>()?,
            )),
            Record::Value(v) => Ok(TreeSpec::Value(v.clone())),
            other => Err(type_error(format!(
                "a {} is not a tensor tree and cannot be flattened",
                other.kind()
            ))),
        }
    }

    /// Inverse of [`Record::flatten`].
    pub fn unflatten(leaves: Vec<Tensor>, spec: &TreeSpec) -> Result<Record> {
        if leaves.len() != spec.num_leaves() {
            return Err(type_error(format!(
                "{} leaves were given for a tree of {} leaves",
                leaves.len(),
                spec.num_leaves()
            )));
        }
        let mut iter = leaves.into_iter();
        Self::unflatten_from(&mut iter, spec)
    }

    fn unflatten_from(iter: &mut std::vec::IntoIter<Tensor>, spec: &TreeSpec) -> Result<Record> {
        Ok(match spec {
            TreeSpec::Leaf => Record::Tensor(
                iter.next()
                    .ok_or_else(|| type_error("ran out of leaves while unflattening".into()))?,
            ),
            TreeSpec::Struct(fields) => Record::Struct(
                fields
                    .iter()
                    .map(|(k, s)| Ok((k.clone(), Self::unflatten_from(iter, s)?)))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .collect(),
            ),
            TreeSpec::Value(v) => Record::Value(v.clone()),
        })
    }

    /// Splits the record into its items along the leading axis.
    ///
    /// Non-array values of a structured record are repeated in every item.
    pub fn unbind(self) -> Result<Vec<Record>> {
        match self {
            Record::List(items) => Ok(items),
            Record::Tensor(t) => Ok(t.unbind()?.into_iter().map(Record::Tensor).collect()),
            Record::Struct(_) => {
                let (leaves, spec) = self.flatten()?;
                let n = match leaves.first() {
                    Some(t) => t.shape().first().copied().ok_or_else(|| {
                        type_error("cannot iterate over a struct of scalars".into())
                    })?,
                    None => {
                        return Err(type_error(
                            "cannot iterate over a struct without array leaves".into(),
                        ))
                    }
                };
                let per_leaf = leaves
                    .iter()
                    .map(|t| {
                        if t.shape().first() != Some(&n) {
                            return Err(type_error(format!(
                                "leaves of a struct must share their leading size: {} vs {:?}",
                                n,
                                t.shape()
                            )));
                        }
                        t.unbind()
                    })
                    .collect::<Result<Vec<_>>>()?;
                (0..n)
                    .map(|i| {
                        let item = per_leaf.iter().map(|ts| ts[i].clone()).collect();
                        Record::unflatten(item, &spec)
                    })
                    .collect()
            }
            Record::Stacked(s) if s.stack_dim() == 0 => Ok(s.into_items()),
            Record::Stacked(_) => Err(StorageError::Unsupported(
                "only lazy stacks along axis 0 can be iterated".into(),
            )
            .into()),
            Record::Value(_) => Err(type_error("cannot iterate over a non-array value".into())),
        }
    }

    /// Stacks items of identical structure along a new leading axis.
    pub fn stack(items: Vec<Record>) -> Result<Record> {
        let first = items
            .first()
            .ok_or_else(|| type_error("cannot stack an empty list of records".into()))?;
        let (_, spec) = first.flatten()?;
        let mut columns: Vec<Vec<Tensor>> = vec![vec![]; spec.num_leaves()];
        for item in items.iter() {
            let (leaves, s) = item.flatten()?;
            if s != spec {
                return Err(type_error(
                    "all items must have the same tree structure to be stacked".into(),
                ));
            }
            leaves
                .into_iter()
                .zip(columns.iter_mut())
                .for_each(|(t, col)| col.push(t));
        }
        let stacked = columns
            .iter()
            .map(|col| Tensor::stack(col, 0))
            .collect::<Result<Vec<_>>>()?;
        Record::unflatten(stacked, &spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(i: i64) -> Result<Record> {
        Ok(Record::from_fields([
            ("obs", Tensor::from_vec(vec![i as f32; 3], &[3])?.into()),
            (
                "next",
                Record::from_fields([("reward", Tensor::scalar(i as f64).into())]),
            ),
            ("tag", Value::from("step").into()),
        ]))
    }

    #[test]
    fn test_flatten_unflatten() -> Result<()> {
        let r = transition(1)?;
        let (leaves, spec) = r.flatten()?;
        assert_eq!(leaves.len(), 2);
        assert_eq!(
            spec.leaf_paths(),
            vec![FieldPath::from("obs"), FieldPath::from("next.reward")]
        );
        assert!(spec.has_values());
        assert_eq!(Record::unflatten(leaves, &spec)?, r);
        Ok(())
    }

    #[test]
    fn test_stack_unbind() -> Result<()> {
        let items = vec![transition(0)?, transition(1)?, transition(2)?];
        let batch = Record::stack(items.clone())?;
        assert_eq!(batch.batch_shape(), vec![3]);
        let obs = batch.get_path(&"obs".into()).unwrap().as_tensor().unwrap();
        assert_eq!(obs.shape(), &[3, 3]);
        assert_eq!(batch.unbind()?, items);
        Ok(())
    }

    #[test]
    fn test_stack_mismatch() -> Result<()> {
        let a = transition(0)?;
        let b = Record::from_fields([("obs", Tensor::from_vec(vec![0f32; 3], &[3])?.into())]);
        let err = Record::stack(vec![a, b]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Type(_))
        ));
        Ok(())
    }

    #[test]
    fn test_file_path() {
        assert_eq!(FieldPath::root().to_file_path("memmap"), PathBuf::from("tensor.memmap"));
        assert_eq!(
            FieldPath::from("a.b").to_file_path("memmap"),
            PathBuf::from("a/b.memmap")
        );
        let a = FieldPath::root().child("obs.a").to_file_path("memmap");
        let b = FieldPath::root().child("obs.b").to_file_path("memmap");
        assert_eq!(a, PathBuf::from("obs.a.memmap"));
        assert_ne!(a, b);
    }
}
