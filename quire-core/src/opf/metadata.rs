//! Mapping between OPF `<metadata>` and [`Metadata`].
//!
//! EPUB 2 packages carry secondary values in `opf:` attributes and
//! `<meta name content>` pairs, EPUB 3 packages in `<meta refines>`
//! refinements. Both are read; writing follows the package version.
//! Calibre extensions (`calibre:series`, `calibre:rating`, ...) are kept as
//! name/content metas in either version.

use std::collections::{BTreeMap, HashMap};

use crate::dom::{Document, NodeId};
use crate::types::{parse_date, Metadata, UserField};

use super::{Package, DEFAULT_UID};

const REPLACED_DC: &[&str] = &[
    "title",
    "creator",
    "publisher",
    "date",
    "language",
    "subject",
    "description",
    "identifier",
];

fn is_dc(doc: &Document, node: NodeId, local: &str) -> bool {
    doc.name(node)
        .map(|n| n.starts_with("dc:") && n[3..].eq_ignore_ascii_case(local))
        .unwrap_or(false)
}

fn dc_elements(doc: &Document, md: NodeId, local: &str) -> Vec<NodeId> {
    doc.children(md)
        .iter()
        .copied()
        .filter(|&c| is_dc(doc, c, local))
        .collect()
}

/// `refines` metas grouped by target id, as `(property, value)` pairs
fn refinements(doc: &Document, md: NodeId) -> HashMap<String, Vec<(String, String)>> {
    let mut out: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for meta in doc.children_named(md, "meta") {
        let (Some(refines), Some(property)) = (doc.attr(meta, "refines"), doc.attr(meta, "property"))
        else {
            continue;
        };
        out.entry(refines.trim_start_matches('#').to_string())
            .or_default()
            .push((property.to_string(), doc.normalized_text(meta)));
    }
    out
}

fn refined<'a>(
    refs: &'a HashMap<String, Vec<(String, String)>>,
    doc: &Document,
    node: NodeId,
    property: &str,
) -> Option<&'a str> {
    let id = doc.attr(node, "id")?;
    refs.get(id)?
        .iter()
        .find(|(p, _)| p == property)
        .map(|(_, v)| v.as_str())
}

/// `content` of `<meta name=... content=...>`, also accepting EPUB 3
/// `<meta property=...>value</meta>`
fn named_meta(doc: &Document, md: NodeId, name: &str) -> Option<String> {
    doc.children_named(md, "meta").into_iter().find_map(|m| {
        if doc.attr(m, "name") == Some(name) {
            doc.attr(m, "content").map(|c| c.trim().to_string())
        } else if doc.attr(m, "property") == Some(name) && doc.attr(m, "refines").is_none() {
            Some(doc.normalized_text(m))
        } else {
            None
        }
    })
}

fn opf_attr<'a>(doc: &'a Document, node: NodeId, local: &str) -> Option<&'a str> {
    doc.element(node)?.attr_local(local)
}

/// Split an identifier into lowercase scheme and bare value
pub fn parse_identifier(text: &str, scheme: Option<&str>) -> Option<(String, String)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(scheme) = scheme.map(str::trim).filter(|s| !s.is_empty()) {
        let scheme = scheme.to_ascii_lowercase();
        let value = strip_scheme_prefix(text, &scheme).unwrap_or(text);
        return Some((scheme, value.to_string()));
    }
    let lower = text.to_ascii_lowercase();
    for (prefix, scheme) in [
        ("urn:isbn:", "isbn"),
        ("urn:uuid:", "uuid"),
        ("urn:doi:", "doi"),
        ("isbn:", "isbn"),
        ("uuid:", "uuid"),
        ("doi:", "doi"),
        ("calibre:", "calibre"),
        ("amazon:", "amazon"),
        ("mobi-asin:", "mobi-asin"),
        ("google:", "google"),
    ] {
        if lower.starts_with(prefix) {
            return Some((scheme.to_string(), text[prefix.len()..].trim().to_string()));
        }
    }
    if uuid::Uuid::parse_str(text).is_ok() {
        return Some(("uuid".to_string(), text.to_string()));
    }
    None
}

fn strip_scheme_prefix<'a>(text: &'a str, scheme: &str) -> Option<&'a str> {
    let lower = text.to_ascii_lowercase();
    [format!("urn:{scheme}:"), format!("{scheme}:")]
        .iter()
        .find(|p| lower.starts_with(p.as_str()))
        .map(|p| &text[p.len()..])
}

/// Read the metadata record of a package
pub fn read_metadata(pkg: &Package) -> Metadata {
    let doc = &pkg.metadata;
    let md = pkg.metadata_element();
    let refs = refinements(doc, md);
    let mut meta = Metadata::default();

    let titles = dc_elements(doc, md, "title");
    let main_title = titles
        .iter()
        .copied()
        .find(|&t| refined(&refs, doc, t, "title-type") == Some("main"))
        .or_else(|| titles.first().copied());
    if let Some(t) = main_title {
        meta.title = doc.normalized_text(t);
        meta.title_sort = refined(&refs, doc, t, "file-as")
            .map(str::to_string)
            .or_else(|| opf_attr(doc, t, "file-as").map(str::to_string));
    }
    if let Some(sort) = named_meta(doc, md, "calibre:title_sort") {
        meta.title_sort = Some(sort);
    }

    for creator in dc_elements(doc, md, "creator") {
        let role = opf_attr(doc, creator, "role")
            .or_else(|| refined(&refs, doc, creator, "role"))
            .unwrap_or("aut");
        if !role.eq_ignore_ascii_case("aut") {
            continue;
        }
        let name = doc.normalized_text(creator);
        if name.is_empty() {
            continue;
        }
        if meta.author_sort.is_none() {
            meta.author_sort = opf_attr(doc, creator, "file-as")
                .or_else(|| refined(&refs, doc, creator, "file-as"))
                .map(str::to_string);
        }
        meta.authors.push(name);
    }

    meta.publisher = dc_elements(doc, md, "publisher")
        .first()
        .map(|&p| doc.normalized_text(p))
        .filter(|p| !p.is_empty());

    let dates = dc_elements(doc, md, "date");
    let pubdate = dates
        .iter()
        .copied()
        .find(|&d| opf_attr(doc, d, "event").map(|e| e.eq_ignore_ascii_case("publication")).unwrap_or(false))
        .or_else(|| {
            dates
                .iter()
                .copied()
                .find(|&d| opf_attr(doc, d, "event").is_none())
        });
    meta.pubdate = pubdate.and_then(|d| parse_date(&doc.text_content(d)));
    meta.timestamp = named_meta(doc, md, "calibre:timestamp").and_then(|t| parse_date(&t));

    let langs: Vec<String> = dc_elements(doc, md, "language")
        .into_iter()
        .map(|l| doc.normalized_text(l))
        .collect();
    meta.set_languages(langs);

    meta.tags = dc_elements(doc, md, "subject")
        .into_iter()
        .map(|s| doc.normalized_text(s))
        .filter(|s| !s.is_empty())
        .collect();

    meta.comments = dc_elements(doc, md, "description")
        .first()
        .map(|&d| doc.text_content(d).trim().to_string())
        .filter(|d| !d.is_empty());

    for ident in dc_elements(doc, md, "identifier") {
        let text = doc.text_content(ident);
        let scheme = opf_attr(doc, ident, "scheme").map(str::to_string).or_else(|| {
            refined(&refs, doc, ident, "identifier-type").map(|t| match t {
                "15" | "02" => "isbn".to_string(),
                "06" => "doi".to_string(),
                other => other.to_string(),
            })
        });
        if let Some((scheme, value)) = parse_identifier(&text, scheme.as_deref()) {
            meta.identifiers.entry(scheme).or_insert(value);
        }
    }

    let series = named_meta(doc, md, "calibre:series");
    let index = named_meta(doc, md, "calibre:series_index").and_then(|i| i.parse::<f64>().ok());
    if series.is_some() {
        meta.set_series(series, index);
    } else if let Some(collection) = doc.children_named(md, "meta").into_iter().find(|&m| {
        doc.attr(m, "property") == Some("belongs-to-collection")
            && refined(&refs, doc, m, "collection-type").map_or(true, |t| t == "series")
    }) {
        let index = refined(&refs, doc, collection, "group-position").and_then(|i| i.parse().ok());
        meta.set_series(Some(doc.normalized_text(collection)), index);
    }

    meta.set_rating(named_meta(doc, md, "calibre:rating").and_then(|r| r.parse::<f64>().ok()));

    for m in doc.children_named(md, "meta") {
        let Some(key) = doc
            .attr(m, "name")
            .and_then(|n| n.strip_prefix("calibre:user_metadata:"))
        else {
            continue;
        };
        let Some(content) = doc.attr(m, "content") else {
            continue;
        };
        match serde_json::from_str::<serde_json::Value>(content) {
            Ok(json) => {
                let field = UserField {
                    datatype: json["datatype"].as_str().unwrap_or("text").to_string(),
                    value: json["#value#"].clone(),
                    display_name: json["name"].as_str().unwrap_or(key).to_string(),
                };
                meta.user_metadata.insert(key.to_string(), field);
            }
            Err(e) => tracing::warn!(column = key, "unreadable user metadata: {e}"),
        }
    }

    meta
}

/// Id of the `<dc:identifier>` carrying the package's unique identifier
fn unique_identifier_value(meta: &Metadata) -> (String, String) {
    if let Some(uuid) = meta.identifiers.get("uuid") {
        return ("uuid".to_string(), uuid.clone());
    }
    match meta.identifiers.iter().next() {
        Some((scheme, value)) => (scheme.clone(), value.clone()),
        None => ("uuid".to_string(), uuid::Uuid::new_v4().to_string()),
    }
}

fn format_identifier(scheme: &str, value: &str, epub3: bool) -> String {
    if !epub3 {
        return value.to_string();
    }
    match scheme {
        "isbn" | "uuid" | "doi" => format!("urn:{scheme}:{value}"),
        other => format!("{other}:{value}"),
    }
}

/// Replace the record-managed parts of the package metadata with `meta`.
/// Metas the record does not model (cover, `dcterms:modified`, vendor
/// extensions) are kept.
pub fn write_metadata(pkg: &mut Package, meta: &Metadata) {
    let epub3 = pkg.is_epub3();
    let uid = if pkg.unique_identifier.is_empty() {
        DEFAULT_UID.to_string()
    } else {
        pkg.unique_identifier.clone()
    };
    pkg.unique_identifier = uid.clone();
    let md = pkg.metadata_element();
    let doc = &mut pkg.metadata;

    // drop what is about to be rewritten, plus refinements of dropped elements
    let mut removed_ids = Vec::new();
    for child in doc.children(md).to_vec() {
        let replaced = REPLACED_DC.iter().any(|l| is_dc(doc, child, l));
        let calibre_meta = doc.is(child, "meta")
            && doc.attr(child, "name").is_some_and(|n| n.starts_with("calibre:"));
        let collection = doc.is(child, "meta")
            && doc.attr(child, "property") == Some("belongs-to-collection");
        if replaced || calibre_meta || collection {
            if let Some(id) = doc.attr(child, "id") {
                removed_ids.push(format!("#{id}"));
            }
            doc.detach(child);
        }
    }
    for child in doc.children(md).to_vec() {
        if doc.is(child, "meta")
            && doc
                .attr(child, "refines")
                .is_some_and(|r| removed_ids.iter().any(|id| id == r))
        {
            doc.detach(child);
        }
    }

    let mut refines: Vec<(String, &str, String)> = Vec::new();

    let (uid_scheme, uid_value) = unique_identifier_value(meta);
    let el = doc.create_element("dc:identifier");
    doc.set_attr(el, "id", &uid);
    if !epub3 {
        doc.set_attr(el, "opf:scheme", uid_scheme.clone());
    }
    let text = doc.create_text(format_identifier(&uid_scheme, &uid_value, epub3));
    doc.append(el, text);
    doc.append(md, el);
    for (scheme, value) in &meta.identifiers {
        if *scheme == uid_scheme {
            continue;
        }
        let el = doc.create_element("dc:identifier");
        if !epub3 {
            let written = if scheme == "isbn" { "ISBN".to_string() } else { scheme.clone() };
            doc.set_attr(el, "opf:scheme", written);
        }
        let text = doc.create_text(format_identifier(scheme, value, epub3));
        doc.append(el, text);
        doc.append(md, el);
    }

    let title = doc.append_text_element(md, "dc:title", &meta.title);
    if epub3 {
        doc.set_attr(title, "id", "meta-title");
        refines.push(("meta-title".into(), "title-type", "main".into()));
        if let Some(sort) = &meta.title_sort {
            refines.push(("meta-title".into(), "file-as", sort.clone()));
        }
    }

    for (i, author) in meta.authors.iter().enumerate() {
        let el = doc.append_text_element(md, "dc:creator", author);
        let sort = (i == 0).then(|| meta.computed_author_sort());
        if epub3 {
            let id = format!("meta-creator{}", i + 1);
            doc.set_attr(el, "id", &id);
            refines.push((id.clone(), "role", "aut".into()));
            if let Some(sort) = sort {
                refines.push((id, "file-as", sort));
            }
        } else {
            doc.set_attr(el, "opf:role", "aut");
            if let Some(sort) = sort {
                doc.set_attr(el, "opf:file-as", sort);
            }
        }
    }

    if let Some(publisher) = &meta.publisher {
        doc.append_text_element(md, "dc:publisher", publisher);
    }
    if let Some(date) = &meta.pubdate {
        doc.append_text_element(md, "dc:date", &date.to_rfc3339());
    }
    for lang in &meta.languages {
        doc.append_text_element(md, "dc:language", lang);
    }
    for tag in &meta.tags {
        doc.append_text_element(md, "dc:subject", tag);
    }
    if let Some(comments) = &meta.comments {
        doc.append_text_element(md, "dc:description", comments);
    }

    let mut named: Vec<(String, String)> = Vec::new();
    if !epub3 {
        if let Some(sort) = &meta.title_sort {
            named.push(("calibre:title_sort".into(), sort.clone()));
        }
    }
    if let (Some(series), Some(index)) = (&meta.series, meta.series_index) {
        named.push(("calibre:series".into(), series.clone()));
        named.push(("calibre:series_index".into(), format_index(index)));
        if epub3 {
            let el = doc.append_text_element(md, "meta", series);
            doc.set_attr(el, "property", "belongs-to-collection");
            doc.set_attr(el, "id", "meta-series");
            refines.push(("meta-series".into(), "collection-type", "series".into()));
            refines.push(("meta-series".into(), "group-position", format_index(index)));
        }
    }
    if let Some(rating) = meta.rating {
        named.push(("calibre:rating".into(), rating.to_string()));
    }
    if let Some(ts) = &meta.timestamp {
        named.push(("calibre:timestamp".into(), ts.to_rfc3339()));
    }
    let user: BTreeMap<&String, &UserField> = meta.user_metadata.iter().collect();
    for (key, field) in user {
        let json = serde_json::json!({
            "datatype": field.datatype,
            "#value#": field.value,
            "name": field.display_name,
        });
        named.push((format!("calibre:user_metadata:{key}"), json.to_string()));
    }
    for (name, content) in named {
        let el = doc.append_element(md, "meta");
        doc.set_attr(el, "name", name);
        doc.set_attr(el, "content", content);
    }
    for (id, property, value) in refines {
        let el = doc.append_text_element(md, "meta", &value);
        doc.set_attr(el, "refines", format!("#{id}"));
        doc.set_attr(el, "property", property);
        if property == "role" {
            doc.set_attr(el, "scheme", "marc:relators");
        }
    }
}

fn format_index(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{}", index as i64)
    } else {
        index.to_string()
    }
}
