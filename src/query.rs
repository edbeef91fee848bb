//! Declarative filters and their translation into fetch plans.
//!
//! The translator only validates and resolves; it never touches storage.
//! A [`FetchPlan`] is executed by a storage adapter, either rendered to SQL
//! or evaluated in process with [`Filter::eval`], which follows SQL's
//! three-valued logic so both paths select the same rows.

use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{OrmError, Result};
use crate::schema::{EntityDescriptor, SchemaRegistry};
use crate::value::{FieldType, Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn is_ordering(&self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// A boolean expression over entity fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    True,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    IsNull(String),
    IsNotNull(String),
    Contains {
        field: String,
        text: String,
    },
    StartsWith {
        field: String,
        text: String,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(field: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn le(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Le, value)
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn ge(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    pub fn is_null(field: &str) -> Self {
        Predicate::IsNull(field.to_string())
    }

    pub fn is_not_null(field: &str) -> Self {
        Predicate::IsNotNull(field.to_string())
    }

    pub fn contains(field: &str, text: &str) -> Self {
        Predicate::Contains {
            field: field.to_string(),
            text: text.to_string(),
        }
    }

    pub fn starts_with(field: &str, text: &str) -> Self {
        Predicate::StartsWith {
            field: field.to_string(),
            text: text.to_string(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::True => other,
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        OrderBy {
            field: field.to_string(),
            ascending: true,
        }
    }

    pub fn desc(field: &str) -> Self {
        OrderBy {
            field: field.to_string(),
            ascending: false,
        }
    }
}

/// Filter, ordering and paging for one entity set.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub predicate: Predicate,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            predicate: Predicate::True,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter; multiple filters are combined with AND.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = std::mem::replace(&mut self.predicate, Predicate::True).and(predicate);
        self
    }

    pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
        self.order_by.push(OrderBy {
            field: field.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// A predicate resolved against a descriptor: fields are column positions.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: String,
        index: usize,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        column: String,
        index: usize,
    },
    IsNotNull {
        column: String,
        index: usize,
    },
    Contains {
        column: String,
        index: usize,
        text: String,
    },
    StartsWith {
        column: String,
        index: usize,
        text: String,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// SQL three-valued evaluation: `None` is UNKNOWN.
    pub fn eval(&self, row: &Row) -> Option<bool> {
        match self {
            Filter::Compare {
                index, op, value, ..
            } => {
                let cell = row.get(*index)?;
                if cell.is_null() {
                    return None;
                }
                cell.partial_cmp_non_null(value).map(|ord| op.holds(ord))
            }
            Filter::IsNull { index, .. } => Some(row.get(*index).is_none_or(Value::is_null)),
            Filter::IsNotNull { index, .. } => Some(row.get(*index).is_some_and(|v| !v.is_null())),
            Filter::Contains { index, text, .. } => {
                row.get(*index)?.as_str().map(|s| s.contains(text.as_str()))
            }
            Filter::StartsWith { index, text, .. } => {
                row.get(*index)?.as_str().map(|s| s.starts_with(text.as_str()))
            }
            Filter::And(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.eval(row) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown { None } else { Some(true) }
            }
            Filter::Or(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.eval(row) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown { None } else { Some(false) }
            }
            Filter::Not(inner) => inner.eval(row).map(|b| !b),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.eval(row) == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub index: usize,
    pub ascending: bool,
}

/// What a storage adapter must fetch. Rows come back in descriptor field order.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub entity: String,
    pub table: String,
    pub columns: Vec<String>,
    pub column_types: Vec<FieldType>,
    pub filter: Option<Filter>,
    pub order: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FetchPlan {
    /// Apply the plan to rows already in memory.
    pub fn apply<I: IntoIterator<Item = Row>>(&self, rows: I) -> Vec<Row> {
        let mut selected: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.filter.as_ref().is_none_or(|f| f.matches(row)))
            .collect();
        selected.sort_by(|a, b| self.compare_rows(a, b));
        selected
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for key in &self.order {
            let ord = a[key.index].sort_cmp(&b[key.index]);
            let ord = if key.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Maps declarative queries onto fetch plans using the registry.
#[derive(Clone)]
pub struct QueryTranslator {
    registry: Arc<SchemaRegistry>,
}

impl QueryTranslator {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        QueryTranslator { registry }
    }

    /// Resolve `predicate` and `order_by` for `entity`.
    ///
    /// The primary key is appended as a final ascending sort term so that
    /// results are deterministic across adapters.
    pub fn translate(
        &self,
        entity: &str,
        predicate: &Predicate,
        order_by: &[OrderBy],
    ) -> Result<FetchPlan> {
        let descriptor = self.registry.describe(entity)?;
        let filter = match predicate {
            Predicate::True => None,
            p => Some(resolve(&descriptor, p)?),
        };

        let mut order = Vec::with_capacity(order_by.len() + 1);
        for term in order_by {
            let index = descriptor.field_index(&term.field).ok_or_else(|| {
                OrmError::UnsupportedQuery(format!(
                    "cannot order `{}` by unknown field `{}`",
                    entity, term.field
                ))
            })?;
            order.push(SortKey {
                column: term.field.clone(),
                index,
                ascending: term.ascending,
            });
        }
        let key_index = descriptor.key_index();
        if !order.iter().any(|k| k.index == key_index) {
            order.push(SortKey {
                column: descriptor.primary_key.clone(),
                index: key_index,
                ascending: true,
            });
        }

        let plan = FetchPlan {
            entity: descriptor.name.clone(),
            table: descriptor.table.clone(),
            columns: descriptor.column_names(),
            column_types: descriptor.fields.iter().map(|f| f.field_type).collect(),
            filter,
            order,
            limit: None,
            offset: 0,
        };
        debug!("Translated query on `{}` into {:?}", entity, plan);
        Ok(plan)
    }

    pub fn plan(&self, entity: &str, query: &Query) -> Result<FetchPlan> {
        let mut plan = self.translate(entity, &query.predicate, &query.order_by)?;
        plan.limit = query.limit;
        plan.offset = query.offset;
        Ok(plan)
    }
}

fn unsupported(descriptor: &EntityDescriptor, reason: String) -> OrmError {
    OrmError::UnsupportedQuery(format!("{} (on `{}`)", reason, descriptor.name))
}

fn column(descriptor: &EntityDescriptor, field: &str) -> Result<(usize, FieldType)> {
    descriptor
        .field_index(field)
        .map(|i| (i, descriptor.fields[i].field_type))
        .ok_or_else(|| unsupported(descriptor, format!("unknown field `{}`", field)))
}

fn resolve(descriptor: &EntityDescriptor, predicate: &Predicate) -> Result<Filter> {
    match predicate {
        Predicate::True => Ok(Filter::And(Vec::new())),
        Predicate::Compare { field, op, value } => {
            let (index, ty) = column(descriptor, field)?;
            if value.is_null() {
                return Err(unsupported(
                    descriptor,
                    format!("`{}` compared with NULL; use is_null/is_not_null", field),
                ));
            }
            if !value.fits(ty) {
                return Err(unsupported(
                    descriptor,
                    format!("`{}` is {} but was compared with {}", field, ty.sql_type(), value),
                ));
            }
            if op.is_ordering() && !ty.is_ordered() {
                return Err(unsupported(
                    descriptor,
                    format!("`{}` {} is not defined for {}", field, op.sql(), ty.sql_type()),
                ));
            }
            Ok(Filter::Compare {
                column: field.clone(),
                index,
                op: *op,
                value: value.clone(),
            })
        }
        Predicate::IsNull(field) => {
            let (index, _) = column(descriptor, field)?;
            Ok(Filter::IsNull {
                column: field.clone(),
                index,
            })
        }
        Predicate::IsNotNull(field) => {
            let (index, _) = column(descriptor, field)?;
            Ok(Filter::IsNotNull {
                column: field.clone(),
                index,
            })
        }
        Predicate::Contains { field, text } | Predicate::StartsWith { field, text } => {
            let (index, ty) = column(descriptor, field)?;
            if ty != FieldType::Text {
                return Err(unsupported(
                    descriptor,
                    format!("text matching on {} field `{}`", ty.sql_type(), field),
                ));
            }
            let column = field.clone();
            let text = text.clone();
            Ok(match predicate {
                Predicate::Contains { .. } => Filter::Contains {
                    column,
                    index,
                    text,
                },
                _ => Filter::StartsWith {
                    column,
                    index,
                    text,
                },
            })
        }
        Predicate::And(parts) => Ok(Filter::And(
            parts
                .iter()
                .map(|p| resolve(descriptor, p))
                .collect::<Result<_>>()?,
        )),
        Predicate::Or(parts) => {
            if parts.is_empty() {
                return Err(unsupported(descriptor, "empty disjunction".to_string()));
            }
            Ok(Filter::Or(
                parts
                    .iter()
                    .map(|p| resolve(descriptor, p))
                    .collect::<Result<_>>()?,
            ))
        }
        Predicate::Not(inner) => Ok(Filter::Not(Box::new(resolve(descriptor, inner)?))),
    }
}
