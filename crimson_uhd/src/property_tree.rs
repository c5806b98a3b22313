//! Device property tree: a hierarchical key-value store of configuration endpoints,
//! addressed by `/`-separated paths.
//!
//! The streamer only depends on the [`PropertyTree`] trait. [`MemoryPropertyTree`]
//! is an in-process implementation with per-path coercers (run on every write,
//! their result is what gets stored) and subscribers (notified after every write).

use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Div;
use std::sync::{Arc, RwLock};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::common::*;
use crate::error::PropertyError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
  Bool(bool),
  Int(i64),
  Double(f64),
  Str(String),
}

impl PropValue {
  fn type_name(&self) -> &'static str {
    match self {
      Self::Bool(_) => "bool",
      Self::Int(_) => "int",
      Self::Double(_) => "double",
      Self::Str(_) => "string",
    }
  }
}

impl Display for PropValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Bool(b) => write!(f, "{}", if *b { "1" } else { "0" }),
      Self::Int(i) => write!(f, "{i}"),
      Self::Double(d) => write!(f, "{d}"),
      Self::Str(s) => f.write_str(s),
    }
  }
}

/// Rust types that can be stored in the tree.
pub trait PropType: Sized {
  const NAME: &'static str;
  fn from_prop(path: &str, value: PropValue) -> Result<Self, PropertyError>;
  fn into_prop(self) -> PropValue;
}

fn mismatch<T: PropType>(path: &str, value: &PropValue) -> PropertyError {
  PropertyError::TypeMismatch { path: path.to_owned(), expected: T::NAME, found: value.type_name() }
}

impl PropType for String {
  const NAME: &'static str = "string";
  fn from_prop(path: &str, value: PropValue) -> Result<Self, PropertyError> {
    match value {
      PropValue::Str(s) => Ok(s),
      PropValue::Int(i) => Ok(i.to_string()),
      other => Err(mismatch::<Self>(path, &other)),
    }
  }
  fn into_prop(self) -> PropValue {
    PropValue::Str(self)
  }
}

impl PropType for f64 {
  const NAME: &'static str = "double";
  fn from_prop(path: &str, value: PropValue) -> Result<Self, PropertyError> {
    match value {
      PropValue::Double(d) => Ok(d),
      PropValue::Int(i) => Ok(i as f64),
      PropValue::Str(s) => {
        s.trim().parse().map_err(|_| PropertyError::Parse { path: path.to_owned(), value: s })
      }
      other => Err(mismatch::<Self>(path, &other)),
    }
  }
  fn into_prop(self) -> PropValue {
    PropValue::Double(self)
  }
}

impl PropType for i64 {
  const NAME: &'static str = "int";
  fn from_prop(path: &str, value: PropValue) -> Result<Self, PropertyError> {
    match value {
      PropValue::Int(i) => Ok(i),
      PropValue::Str(s) => {
        s.trim().parse().map_err(|_| PropertyError::Parse { path: path.to_owned(), value: s })
      }
      other => Err(mismatch::<Self>(path, &other)),
    }
  }
  fn into_prop(self) -> PropValue {
    PropValue::Int(self)
  }
}

impl PropType for bool {
  const NAME: &'static str = "bool";
  fn from_prop(path: &str, value: PropValue) -> Result<Self, PropertyError> {
    match value {
      PropValue::Bool(b) => Ok(b),
      PropValue::Int(i) => Ok(i != 0),
      PropValue::Str(s) => match s.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(PropertyError::Parse { path: path.to_owned(), value: s }),
      },
      other => Err(mismatch::<Self>(path, &other)),
    }
  }
  fn into_prop(self) -> PropValue {
    PropValue::Bool(self)
  }
}

/// A normalized tree path. Joined with `/`, like a filesystem path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsPath(String);

impl FsPath {
  pub fn new(path: &str) -> Self {
    Self(path.split('/').filter(|s| !s.is_empty()).join("/"))
  }
  pub fn as_str(&self) -> &str {
    &self.0
  }
  /// Last component of the path.
  pub fn leaf(&self) -> &str {
    self.0.rsplit('/').next().unwrap_or("")
  }
}

impl<T: AsRef<str>> Div<T> for FsPath {
  type Output = FsPath;
  fn div(self, rhs: T) -> FsPath {
    FsPath::new(&format!("{}/{}", self.0, rhs.as_ref()))
  }
}

impl<T: AsRef<str>> Div<T> for &FsPath {
  type Output = FsPath;
  fn div(self, rhs: T) -> FsPath {
    self.clone() / rhs
  }
}

impl Display for FsPath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "/{}", self.0)
  }
}

impl AsRef<str> for FsPath {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

pub trait PropertyTree: Send + Sync {
  fn get_value(&self, path: &str) -> Result<PropValue, PropertyError>;
  fn set_value(&self, path: &str, value: PropValue) -> Result<(), PropertyError>;
  /// Re-writes the current value, which runs the coercer and subscribers again.
  fn update(&self, path: &str) -> Result<(), PropertyError>;
  fn exists(&self, path: &str) -> bool;
  /// Names of the direct children of `path`.
  fn list(&self, path: &str) -> Vec<String>;
}

/// Typed accessors for any [`PropertyTree`].
pub trait PropertyTreeExt {
  fn get<T: PropType>(&self, path: impl AsRef<str>) -> Result<T, PropertyError>;
  fn set<T: PropType>(&self, path: impl AsRef<str>, value: T) -> Result<(), PropertyError>;
}

impl<P: PropertyTree + ?Sized> PropertyTreeExt for P {
  fn get<T: PropType>(&self, path: impl AsRef<str>) -> Result<T, PropertyError> {
    let path = path.as_ref();
    T::from_prop(path, self.get_value(path)?)
  }
  fn set<T: PropType>(&self, path: impl AsRef<str>, value: T) -> Result<(), PropertyError> {
    self.set_value(path.as_ref(), value.into_prop())
  }
}

pub type Coercer = Arc<dyn Fn(PropValue) -> PropValue + Send + Sync>;
pub type Subscriber = Arc<dyn Fn(&PropValue) + Send + Sync>;

#[derive(Default)]
struct Node {
  value: Option<PropValue>,
  coercer: Option<Coercer>,
  subscribers: Vec<Subscriber>,
}

#[derive(Default)]
pub struct MemoryPropertyTree {
  nodes: RwLock<BTreeMap<FsPath, Node>>,
}

impl MemoryPropertyTree {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builds a tree from a TOML document. Nested tables become path components:
  /// `[mboards.0.rx_link.Channel_A]` + `port = "42820"` creates `/mboards/0/rx_link/Channel_A/port`.
  pub fn from_toml_str(document: &str) -> Result<Self, PropertyError> {
    let table: toml::Table = toml::from_str(document).map_err(|e| PropertyError::Document(e.to_string()))?;
    let tree = Self::new();
    tree.load_table(&FsPath::new(""), &table)?;
    Ok(tree)
  }

  fn load_table(&self, prefix: &FsPath, table: &toml::Table) -> Result<(), PropertyError> {
    for (key, value) in table {
      let path = prefix / key;
      match value {
        toml::Value::Table(sub) => self.load_table(&path, sub)?,
        leaf => {
          let prop: PropValue = leaf
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| PropertyError::Document(format!("{path}: {e}")))?;
          self.create_with(path.as_str(), prop);
        }
      }
    }
    Ok(())
  }

  /// Serializes the current values back into a nested TOML document.
  pub fn to_toml_string(&self) -> Result<String, PropertyError> {
    let nodes = self.nodes.read().unwrap();
    let mut root = toml::Table::new();
    for (path, node) in nodes.iter() {
      let Some(value) = &node.value else { continue };
      let mut table = &mut root;
      let components = path.as_str().split('/').collect_vec();
      let Some((leaf, dirs)) = components.split_last() else { continue };
      for dir in dirs {
        let entry = table.entry(dir.to_string()).or_insert_with(|| toml::Value::Table(toml::Table::new()));
        table = match entry {
          toml::Value::Table(t) => t,
          _ => return Err(PropertyError::Document(format!("{path} is both a value and a directory"))),
        };
      }
      let value = toml::Value::try_from(value).map_err(|e| PropertyError::Document(e.to_string()))?;
      table.insert(leaf.to_string(), value);
    }
    toml::to_string(&root).map_err(|e| PropertyError::Document(e.to_string()))
  }

  /// Creates an empty node. Does nothing if the path already exists.
  pub fn create(&self, path: &str) {
    self.nodes.write().unwrap().entry(FsPath::new(path)).or_default();
  }

  /// Creates a node holding `value`, replacing any previous value without notifying anyone.
  pub fn create_with(&self, path: &str, value: PropValue) {
    self.nodes.write().unwrap().entry(FsPath::new(path)).or_default().value = Some(value);
  }

  pub fn set_coercer(&self, path: &str, coercer: impl Fn(PropValue) -> PropValue + Send + Sync + 'static) {
    self.nodes.write().unwrap().entry(FsPath::new(path)).or_default().coercer = Some(Arc::new(coercer));
  }

  pub fn add_subscriber(&self, path: &str, subscriber: impl Fn(&PropValue) + Send + Sync + 'static) {
    self.nodes.write().unwrap().entry(FsPath::new(path)).or_default().subscribers.push(Arc::new(subscriber));
  }

  pub fn remove(&self, path: &str) {
    self.nodes.write().unwrap().remove(&FsPath::new(path));
  }
}

impl PropertyTree for MemoryPropertyTree {
  fn get_value(&self, path: &str) -> Result<PropValue, PropertyError> {
    let key = FsPath::new(path);
    let nodes = self.nodes.read().unwrap();
    let node = nodes.get(&key).ok_or_else(|| PropertyError::PathNotFound(key.to_string()))?;
    node.value.clone().ok_or_else(|| PropertyError::Unset { path: key.to_string() })
  }

  fn set_value(&self, path: &str, value: PropValue) -> Result<(), PropertyError> {
    let key = FsPath::new(path);
    // coercers and subscribers run without the lock held, they may access the tree themselves
    let coercer = {
      let nodes = self.nodes.read().unwrap();
      let node = nodes.get(&key).ok_or_else(|| PropertyError::PathNotFound(key.to_string()))?;
      node.coercer.clone()
    };
    let value = match coercer {
      Some(coerce) => coerce(value),
      None => value,
    };
    let subscribers = {
      let mut nodes = self.nodes.write().unwrap();
      let node = nodes.get_mut(&key).ok_or_else(|| PropertyError::PathNotFound(key.to_string()))?;
      node.value = Some(value.clone());
      node.subscribers.clone()
    };
    trace!("property {key} = {value}");
    for subscriber in subscribers {
      subscriber(&value);
    }
    Ok(())
  }

  fn update(&self, path: &str) -> Result<(), PropertyError> {
    let current = self.get_value(path)?;
    self.set_value(path, current)
  }

  fn exists(&self, path: &str) -> bool {
    self.nodes.read().unwrap().contains_key(&FsPath::new(path))
  }

  fn list(&self, path: &str) -> Vec<String> {
    let prefix = FsPath::new(path);
    let nodes = self.nodes.read().unwrap();
    nodes
      .keys()
      .filter_map(|key| {
        let rest = if prefix.as_str().is_empty() {
          key.as_str()
        } else {
          key.as_str().strip_prefix(prefix.as_str())?.strip_prefix('/')?
        };
        rest.split('/').next().map(str::to_owned)
      })
      .unique()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_paths_are_normalized() {
    let p = FsPath::new("/mboards//0/") / "rx_link" / "Channel_A/port";
    assert_eq!(p.as_str(), "mboards/0/rx_link/Channel_A/port");
    assert_eq!(p.to_string(), "/mboards/0/rx_link/Channel_A/port");
    assert_eq!(p.leaf(), "port");
  }

  #[test]
  fn test_typed_get_set() {
    let tree = MemoryPropertyTree::new();
    tree.create("/a/rate");
    tree.create("/a/pwr");
    assert_eq!(tree.get::<f64>("/a/rate"), Err(PropertyError::Unset { path: "/a/rate".to_owned() }));
    tree.set("/a/rate", 1.5e6).unwrap();
    tree.set("a/pwr", "1".to_owned()).unwrap();
    assert_eq!(tree.get::<f64>("/a/rate").unwrap(), 1.5e6);
    assert!(tree.get::<bool>("/a/pwr").unwrap());
    assert!(matches!(tree.get::<bool>("/a/rate"), Err(PropertyError::TypeMismatch { .. })));
    assert_eq!(tree.set("/nope", 1i64), Err(PropertyError::PathNotFound("/nope".to_owned())));
  }

  #[test]
  fn test_coercer_runs_on_update() {
    let tree = MemoryPropertyTree::new();
    tree.create_with("/rate", PropValue::Double(1000.0));
    let calls = Arc::new(AtomicUsize::new(0));
    let calls1 = calls.clone();
    tree.set_coercer("/rate", |v| match v {
      PropValue::Double(d) => PropValue::Double((d / 100.0).round() * 100.0),
      other => other,
    });
    tree.add_subscriber("/rate", move |_| {
      calls1.fetch_add(1, Ordering::SeqCst);
    });
    tree.set("/rate", 1234.0).unwrap();
    assert_eq!(tree.get::<f64>("/rate").unwrap(), 1200.0);
    tree.update("/rate").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_subscriber_may_access_tree() {
    let tree = Arc::new(MemoryPropertyTree::new());
    tree.create_with("/in", PropValue::Int(0));
    tree.create_with("/out", PropValue::Int(0));
    let weak = Arc::downgrade(&tree);
    tree.add_subscriber("/in", move |v| {
      if let (Some(t), PropValue::Int(i)) = (weak.upgrade(), v) {
        t.set("/out", i * 2).unwrap();
      }
    });
    tree.set("/in", 21i64).unwrap();
    assert_eq!(tree.get::<i64>("/out").unwrap(), 42);
  }

  #[test]
  fn test_toml_load_list_and_dump() {
    let tree = MemoryPropertyTree::from_toml_str(
      r#"
      [mboards.0]
      tick_rate = 322265625.0
      [mboards.0.rx_link.Channel_A]
      port = "42820"
      ip_dest = "10.10.10.10"
      [mboards.0.rx_link.Channel_B]
      port = 42821
      "#,
    )
    .unwrap();
    assert_eq!(tree.get::<String>("/mboards/0/rx_link/Channel_B/port").unwrap(), "42821");
    assert_eq!(tree.list("/mboards/0/rx_link"), vec!["Channel_A", "Channel_B"]);
    assert_eq!(tree.list("/mboards/0"), vec!["rx_link", "tick_rate"]);

    let again = MemoryPropertyTree::from_toml_str(&tree.to_toml_string().unwrap()).unwrap();
    assert_eq!(again.get::<f64>("/mboards/0/tick_rate").unwrap(), 322265625.0);
    assert_eq!(again.get::<String>("/mboards/0/rx_link/Channel_A/ip_dest").unwrap(), "10.10.10.10");
  }

  #[test]
  fn test_list_names_each_child_once() {
    let tree = MemoryPropertyTree::new();
    tree.create_with("/p/a", PropValue::Int(1));
    tree.create_with("/p/a/x", PropValue::Int(2));
    tree.create_with("/p/a-b", PropValue::Int(3));
    assert_eq!(tree.list("/p"), vec!["a", "a-b"]);
  }
}
