use serde_json::Value;

use applytrack_core::{AuthContext, Record, RelationKind, Row, Table};

use crate::{DatabaseState, DbError};

/// Parsed column list of a `select(...)` call, including embedded relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectSpec {
    pub columns: Columns,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Columns {
    All,
    Only(Vec<String>),
}

/// Relation embedded in the result under `alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    pub alias: String,
    pub relation: String,
    pub spec: SelectSpec,
}

impl Default for SelectSpec {
    fn default() -> Self {
        Self {
            columns: Columns::All,
            embeds: Vec::new(),
        }
    }
}

impl SelectSpec {
    /// Parses a PostgREST column list such as `*, activities:application_activities(id, activity_type)`.
    pub fn parse(raw: &str) -> Result<Self, DbError> {
        let mut columns = Vec::new();
        let mut all = false;
        let mut embeds = Vec::new();

        for item in split_items(raw)? {
            if item == "*" {
                all = true;
                continue;
            }
            if let Some(open) = item.find('(') {
                let inner = item[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| DbError::Malformed(format!("unbalanced select item '{item}'")))?;
                let head = item[..open].trim();
                let (alias, relation) = match head.split_once(':') {
                    Some((alias, relation)) => (alias.trim(), relation.trim()),
                    None => (head, head),
                };
                if relation.is_empty() {
                    return Err(DbError::Malformed(format!("missing relation in '{item}'")));
                }
                embeds.push(Embed {
                    alias: alias.to_string(),
                    relation: relation.to_string(),
                    spec: Self::parse(inner)?,
                });
            } else {
                columns.push(item.to_string());
            }
        }

        let columns = if all || (columns.is_empty() && embeds.is_empty()) {
            Columns::All
        } else {
            Columns::Only(columns)
        };
        Ok(Self { columns, embeds })
    }

    /// Projects `record` and attaches embedded relations visible to `auth`.
    pub(crate) fn render(
        &self,
        state: &DatabaseState,
        record: &Record,
        auth: &AuthContext,
    ) -> Result<Row, DbError> {
        let table = record.table();
        let full = record.to_row();
        let mut row = match &self.columns {
            Columns::All => full.clone(),
            Columns::Only(columns) => {
                let mut projected = Row::new();
                for column in columns {
                    let value = full.get(column).ok_or_else(|| DbError::UnknownColumn {
                        table,
                        column: column.clone(),
                    })?;
                    projected.insert(column.clone(), value.clone());
                }
                projected
            }
        };

        for embed in &self.embeds {
            let relation = table
                .relation(&embed.relation)
                .ok_or_else(|| DbError::UnknownRelation {
                    table,
                    relation: embed.relation.clone(),
                })?;
            let value = match relation.kind {
                RelationKind::HasMany => {
                    let children = related_children(state, relation.target, relation.foreign_key, record.id(), auth);
                    let mut rendered = Vec::with_capacity(children.len());
                    for child in children {
                        rendered.push(Value::Object(embed.spec.render(state, child, auth)?));
                    }
                    Value::Array(rendered)
                }
                RelationKind::BelongsTo => {
                    let parent = full
                        .get(relation.foreign_key)
                        .and_then(Value::as_str)
                        .and_then(|id| state.get(relation.target, id))
                        .filter(|parent| auth.can_access(parent.owner()));
                    match parent {
                        Some(parent) => Value::Object(embed.spec.render(state, parent, auth)?),
                        None => Value::Null,
                    }
                }
            };
            row.insert(embed.alias.clone(), value);
        }

        Ok(row)
    }
}

/// Rows of `target` whose `foreign_key` column references `parent_id`.
pub(crate) fn related_children<'a>(
    state: &'a DatabaseState,
    target: Table,
    foreign_key: &str,
    parent_id: &str,
    auth: &AuthContext,
) -> Vec<&'a Record> {
    state
        .table(target)
        .map(|data| {
            data.iter()
                .filter(|child| references(child, foreign_key, parent_id))
                .filter(|child| auth.can_access(child.owner()))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn references(record: &Record, foreign_key: &str, parent_id: &str) -> bool {
    record
        .to_row()
        .get(foreign_key)
        .and_then(Value::as_str)
        .map(|value| value == parent_id)
        .unwrap_or(false)
}

fn split_items(raw: &str) -> Result<Vec<&str>, DbError> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| DbError::Malformed(format!("unbalanced select '{raw}'")))?
            }
            ',' if depth == 0 => {
                items.push(raw[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(DbError::Malformed(format!("unbalanced select '{raw}'")));
    }
    items.push(raw[start..].trim());
    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_star_with_embed() {
        let spec = SelectSpec::parse("*, application_activities(*)").expect("valid");
        assert_eq!(spec.columns, Columns::All);
        assert_eq!(spec.embeds.len(), 1);
        assert_eq!(spec.embeds[0].alias, "application_activities");
        assert_eq!(spec.embeds[0].spec.columns, Columns::All);
    }

    #[test]
    fn parses_aliases_and_column_lists() {
        let spec =
            SelectSpec::parse("id, company_name, activities:application_activities(id, activity_type)")
                .expect("valid");
        assert_eq!(
            spec.columns,
            Columns::Only(vec!["id".to_string(), "company_name".to_string()])
        );
        let embed = &spec.embeds[0];
        assert_eq!(embed.alias, "activities");
        assert_eq!(embed.relation, "application_activities");
        assert_eq!(
            embed.spec.columns,
            Columns::Only(vec!["id".to_string(), "activity_type".to_string()])
        );
    }

    #[test]
    fn empty_select_means_all_columns() {
        assert_eq!(SelectSpec::parse("").expect("valid"), SelectSpec::default());
    }

    #[test]
    fn rejects_unbalanced_select() {
        assert!(matches!(
            SelectSpec::parse("*, companies(name"),
            Err(DbError::Malformed(_))
        ));
    }
}
