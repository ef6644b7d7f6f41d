//! Declarative backend queries
//!
//! A `QueryExpression` describes one retrieve-multiple request: entity,
//! columns, nested filters, ordering, inner joins and an optional row limit.
//! It serializes to FetchXML, which is what the backend accepts.

use std::fmt::Write as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Columns to return
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnSet {
    /// Every attribute of the entity
    All,
    /// Only the named attributes
    Columns(Vec<String>),
}

impl ColumnSet {
    /// Named columns
    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnSet::Columns(names.into_iter().map(Into::into).collect())
    }
}

/// How conditions of a filter are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperator {
    /// All conditions must hold
    And,
    /// Any condition may hold
    Or,
}

impl LogicalOperator {
    fn as_str(&self) -> &'static str {
        match self {
            LogicalOperator::And => "and",
            LogicalOperator::Or => "or",
        }
    }
}

/// Condition operators understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    /// `attr = value`
    Equal,
    /// `attr <> value`
    NotEqual,
    /// `attr >= value`
    GreaterEqual,
    /// `attr <= value`
    LessEqual,
    /// `attr < value`
    LessThan,
    /// `attr IN (values)`
    In,
    /// `attr` within the last N days
    LastXDays(u32),
    /// `attr` is today
    Today,
}

impl ConditionOperator {
    fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equal => "eq",
            ConditionOperator::NotEqual => "ne",
            ConditionOperator::GreaterEqual => "ge",
            ConditionOperator::LessEqual => "le",
            ConditionOperator::LessThan => "lt",
            ConditionOperator::In => "in",
            ConditionOperator::LastXDays(_) => "last-x-days",
            ConditionOperator::Today => "today",
        }
    }
}

/// A single attribute condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Attribute the condition applies to
    pub attribute: String,
    /// Operator
    pub operator: ConditionOperator,
    /// Operand values (empty for `Today` and `LastXDays`)
    pub values: Vec<String>,
}

impl Condition {
    /// Create a condition with explicit values
    pub fn new<A, I, S>(attribute: A, operator: ConditionOperator, values: I) -> Self
    where
        A: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attribute: attribute.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `attr = value`
    pub fn equal<A: Into<String>, V: Into<String>>(attribute: A, value: V) -> Self {
        Self::new(attribute, ConditionOperator::Equal, [value.into()])
    }

    /// `attr IN (values)`
    pub fn in_values<A, I, S>(attribute: A, values: I) -> Self
    where
        A: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(attribute, ConditionOperator::In, values)
    }

    /// Compare an attribute against a timestamp
    pub fn at<A: Into<String>>(attribute: A, operator: ConditionOperator, timestamp: DateTime<Utc>) -> Self {
        Self::new(attribute, operator, [format_timestamp(&timestamp)])
    }

    /// `attr` within the last `days` days
    pub fn last_x_days<A: Into<String>>(attribute: A, days: u32) -> Self {
        Self::new(attribute, ConditionOperator::LastXDays(days), Vec::<String>::new())
    }

    /// `attr` is today
    pub fn today<A: Into<String>>(attribute: A) -> Self {
        Self::new(attribute, ConditionOperator::Today, Vec::<String>::new())
    }
}

/// A group of conditions and nested groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExpression {
    /// How members are combined
    pub logical: LogicalOperator,
    /// Conditions
    pub conditions: Vec<Condition>,
    /// Nested filters
    pub filters: Vec<FilterExpression>,
}

impl FilterExpression {
    /// Create an empty filter
    pub fn new(logical: LogicalOperator) -> Self {
        Self { logical, conditions: Vec::new(), filters: Vec::new() }
    }

    /// Add a condition
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Whether the filter constrains anything
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.filters.iter().all(FilterExpression::is_empty)
    }
}

impl Default for FilterExpression {
    fn default() -> Self {
        Self::new(LogicalOperator::And)
    }
}

/// Sort order on one attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderExpression {
    /// Attribute to sort by
    pub attribute: String,
    /// Descending when true
    pub descending: bool,
}

/// Inner join to a related entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntity {
    /// Linked entity
    pub name: String,
    /// Attribute on the linked entity
    pub from: String,
    /// Attribute on the parent entity
    pub to: String,
    /// Alias prefixed to projected columns
    pub alias: String,
    /// Columns projected from the linked entity
    pub columns: Vec<String>,
    /// Further joins
    pub links: Vec<LinkEntity>,
}

impl LinkEntity {
    /// Create an inner join
    pub fn inner<N, F, T, A>(name: N, from: F, to: T, alias: A) -> Self
    where
        N: Into<String>,
        F: Into<String>,
        T: Into<String>,
        A: Into<String>,
    {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
            alias: alias.into(),
            columns: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Project columns from the linked entity
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Nest another join
    pub fn with_link(mut self, link: LinkEntity) -> Self {
        self.links.push(link);
        self
    }
}

/// Page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// 1-based page number
    pub number: u32,
    /// Rows per page
    pub count: u32,
}

/// A retrieve-multiple request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryExpression {
    /// Entity to query
    pub entity_name: String,
    /// Columns to return
    pub columns: ColumnSet,
    /// Top-level filter
    pub criteria: FilterExpression,
    /// Sort order
    pub orders: Vec<OrderExpression>,
    /// Inner joins
    pub links: Vec<LinkEntity>,
    /// Row limit
    pub top: Option<u32>,
    /// Remove duplicate rows
    pub distinct: bool,
    /// Paging, set by clients that page through results; ignored when `top` is set
    pub page: Option<PageInfo>,
}

impl QueryExpression {
    /// Query every column of an entity
    pub fn new<S: Into<String>>(entity_name: S) -> Self {
        Self {
            entity_name: entity_name.into(),
            columns: ColumnSet::All,
            criteria: FilterExpression::default(),
            orders: Vec::new(),
            links: Vec::new(),
            top: None,
            distinct: false,
            page: None,
        }
    }

    /// Restrict the returned columns
    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.columns = columns;
        self
    }

    /// Add a condition to the top-level filter
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.criteria.conditions.push(condition);
        self
    }

    /// Add a nested filter to the top-level filter
    pub fn with_filter(mut self, filter: FilterExpression) -> Self {
        self.criteria.filters.push(filter);
        self
    }

    /// Add a sort order
    pub fn with_order<S: Into<String>>(mut self, attribute: S, descending: bool) -> Self {
        self.orders.push(OrderExpression { attribute: attribute.into(), descending });
        self
    }

    /// Add an inner join
    pub fn with_link(mut self, link: LinkEntity) -> Self {
        self.links.push(link);
        self
    }

    /// Limit the number of rows
    pub fn with_top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Remove duplicate rows
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Copy of the query asking for one page
    pub fn page(&self, number: u32, count: u32) -> Self {
        let mut query = self.clone();
        query.page = Some(PageInfo { number, count });
        query
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        format!("RetrieveMultiple({})", self.entity_name)
    }

    /// Serialize to FetchXML
    pub fn to_fetch_xml(&self) -> String {
        let mut xml = String::from("<fetch");
        if self.distinct {
            xml.push_str(" distinct='true'");
        }
        match (self.top, self.page) {
            (Some(top), _) => {
                let _ = write!(xml, " top='{}'", top);
            }
            (None, Some(page)) => {
                let _ = write!(xml, " count='{}' page='{}'", page.count, page.number);
            }
            (None, None) => {}
        }
        xml.push('>');

        let _ = write!(xml, "<entity name='{}'>", escape(&self.entity_name));
        match &self.columns {
            ColumnSet::All => xml.push_str("<all-attributes />"),
            ColumnSet::Columns(columns) => write_attributes(&mut xml, columns),
        }
        write_filter(&mut xml, &self.criteria);
        for order in &self.orders {
            let _ = write!(
                xml,
                "<order attribute='{}' descending='{}' />",
                escape(&order.attribute),
                order.descending
            );
        }
        for link in &self.links {
            write_link(&mut xml, link);
        }
        xml.push_str("</entity></fetch>");
        xml
    }
}

/// Timestamp format used in query values
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn write_attributes(xml: &mut String, columns: &[String]) {
    for column in columns {
        let _ = write!(xml, "<attribute name='{}' />", escape(column));
    }
}

fn write_filter(xml: &mut String, filter: &FilterExpression) {
    if filter.is_empty() {
        return;
    }

    let _ = write!(xml, "<filter type='{}'>", filter.logical.as_str());
    for condition in &filter.conditions {
        write_condition(xml, condition);
    }
    for nested in &filter.filters {
        write_filter(xml, nested);
    }
    xml.push_str("</filter>");
}

fn write_condition(xml: &mut String, condition: &Condition) {
    let _ = write!(
        xml,
        "<condition attribute='{}' operator='{}'",
        escape(&condition.attribute),
        condition.operator.as_str()
    );

    match condition.operator {
        ConditionOperator::Today => xml.push_str(" />"),
        ConditionOperator::LastXDays(days) => {
            let _ = write!(xml, " value='{}' />", days);
        }
        ConditionOperator::In => {
            xml.push('>');
            for value in &condition.values {
                let _ = write!(xml, "<value>{}</value>", escape(value));
            }
            xml.push_str("</condition>");
        }
        _ => {
            let value = condition.values.first().map(String::as_str).unwrap_or_default();
            let _ = write!(xml, " value='{}' />", escape(value));
        }
    }
}

fn write_link(xml: &mut String, link: &LinkEntity) {
    let _ = write!(
        xml,
        "<link-entity name='{}' from='{}' to='{}' link-type='inner' alias='{}'>",
        escape(&link.name),
        escape(&link.from),
        escape(&link.to),
        escape(&link.alias)
    );
    write_attributes(xml, &link.columns);
    for nested in &link.links {
        write_link(xml, nested);
    }
    xml.push_str("</link-entity>");
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
