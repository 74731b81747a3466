//! Tables rewritten as a run of blocks, one per cell.

use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::Book;

use super::{edit_spine, Transform};

pub struct LinearizeTables;

impl LinearizeTables {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinearizeTables {
    fn default() -> Self {
        Self::new()
    }
}

fn classes(doc: &Document, node: NodeId) -> Vec<String> {
    doc.attr(node, "class")
        .map(|c| c.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Rows of `table` in order, each with whether it belongs to the header
fn rows(doc: &Document, table: NodeId) -> Vec<(NodeId, bool)> {
    let mut out = Vec::new();
    for child in doc.element_children(table) {
        match doc.local_name(child) {
            Some("tr") => out.push((child, false)),
            Some(group @ ("thead" | "tbody" | "tfoot")) => {
                let header = group == "thead";
                out.extend(doc.children_named(child, "tr").into_iter().map(|r| (r, header)));
            }
            _ => {}
        }
    }
    out
}

fn linearize(doc: &mut Document, table: NodeId) {
    let block = doc.create_element("div");
    let mut table_classes = classes(doc, table);
    table_classes.insert(0, "table".to_string());
    doc.set_attr(block, "class", table_classes.join(" "));
    if let Some(id) = doc.attr(table, "id").map(str::to_string) {
        doc.set_attr(block, "id", id);
    }

    if let Some(caption) = doc.child_named(table, "caption") {
        let div = doc.create_element_with("div", &[("class", "caption")]);
        doc.move_children(caption, div);
        doc.append(block, div);
    }
    for (row, in_head) in rows(doc, table) {
        let row_classes = classes(doc, row);
        let cells: Vec<NodeId> = doc
            .element_children(row)
            .into_iter()
            .filter(|&c| doc.is(c, "td") || doc.is(c, "th"))
            .collect();
        let header_row = in_head || (!cells.is_empty() && cells.iter().all(|&c| doc.is(c, "th")));
        for cell in cells {
            if doc.normalized_text(cell).is_empty() && doc.element_children(cell).is_empty() {
                continue;
            }
            let mut cell_classes = row_classes.clone();
            cell_classes.extend(classes(doc, cell));
            if header_row || doc.is(cell, "th") {
                cell_classes.push("table-header".to_string());
            }
            let div = doc.create_element("div");
            if !cell_classes.is_empty() {
                doc.set_attr(div, "class", cell_classes.join(" "));
            }
            if let Some(id) = doc.attr(cell, "id").map(str::to_string) {
                doc.set_attr(div, "id", id);
            }
            doc.move_children(cell, div);
            doc.append(block, div);
        }
    }
    doc.replace(table, block);
}

impl Transform for LinearizeTables {
    fn name(&self) -> &'static str {
        "linearize_tables"
    }

    fn description(&self) -> &'static str {
        "Turn tables into sequences of blocks"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool("linearize_tables", false, "Turn tables into blocks")]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let mut count = 0;
        edit_spine(book, ctx, |_, doc| {
            // innermost first so a cell never holds a table while it moves
            let mut tables = doc.elements_by_name(doc.root(), "table");
            tables.reverse();
            for &table in &tables {
                linearize(doc, table);
            }
            count += tables.len();
            Ok(!tables.is_empty())
        })?;
        if count > 0 {
            ctx.log.info(format!("linearized {count} tables"));
        }
        Ok(())
    }
}
