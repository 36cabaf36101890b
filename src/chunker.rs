//! AST-aware chunking with greedy sibling packing.
//!
//! Each indexed file is split into bounded, line-ranged chunks. Files with
//! a tree-sitter grammar split on natural boundaries (functions, classes,
//! top-level statements), packing adjacent small nodes until the configured
//! size limit; everything else falls back to deterministic line-window
//! packing. The chunker is pure: output depends only on input and settings.
//!
//! The contextualized form — file path, enclosing scope chain, entity
//! hints, and language prepended to the raw slice — is what gets embedded.

use sha2::{Digest, Sha256};
use std::path::Path;
use tree_sitter::{Node, Parser};

use crate::languages::{detect_language, language_label, Lang};

/// One chunk of a file before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftChunk {
    /// POSIX path relative to the resource root.
    pub filepath: String,
    /// 1-based inclusive line range.
    pub line_start: i64,
    pub line_end: i64,
    /// Raw slice of the file.
    pub text: String,
    /// The embedded form: scope/entity hints prepended to `text`.
    pub contextualized_text: String,
    /// Enclosing scope chain, e.g. `"Server > handle_request"`.
    pub scope: String,
    /// Named entity hints, comma-separated.
    pub entities: String,
    pub language: String,
    /// `sha256(filepath ':' line_start ':' line_end ':' contextualized_text)`.
    pub hash: String,
}

/// Input for one file.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub filepath: String,
    pub code: String,
}

/// Per-file chunking outcome. Errors become job warnings upstream.
#[derive(Debug)]
pub struct FileChunks {
    pub filepath: String,
    pub result: std::result::Result<Vec<DraftChunk>, String>,
}

/// Chunk a batch of files. Output order follows input order.
#[must_use]
pub fn chunk_files(inputs: &[FileInput], max_chunk_size: usize) -> Vec<FileChunks> {
    inputs
        .iter()
        .map(|input| FileChunks {
            filepath: input.filepath.clone(),
            result: chunk_one(&input.filepath, &input.code, max_chunk_size),
        })
        .collect()
}

/// Chunk a single file.
pub fn chunk_one(
    filepath: &str,
    code: &str,
    max_chunk_size: usize,
) -> std::result::Result<Vec<DraftChunk>, String> {
    let path = Path::new(filepath);
    match detect_language(path) {
        Some(lang) => chunk_ast(filepath, code, lang, max_chunk_size),
        None => Ok(chunk_lines(
            filepath,
            code,
            &language_label(path),
            max_chunk_size,
        )),
    }
}

struct AstCtx<'a> {
    filepath: &'a str,
    source: &'a str,
    lang: Lang,
    max_chunk_size: usize,
}

fn chunk_ast(
    filepath: &str,
    code: &str,
    lang: Lang,
    max_chunk_size: usize,
) -> std::result::Result<Vec<DraftChunk>, String> {
    let mut parser = Parser::new();
    parser
        .set_language(&lang.grammar())
        .map_err(|e| format!("grammar load failed: {e}"))?;
    let tree = parser
        .parse(code, None)
        .ok_or_else(|| format!("parse failed for {filepath}"))?;

    let ctx = AstCtx {
        filepath,
        source: code,
        lang,
        max_chunk_size,
    };
    let mut chunks = Vec::new();
    pack_children(&ctx, &tree.root_node(), "", &mut chunks);

    // AST produced nothing for a non-empty file (e.g. only comments):
    // fall back so the content is still retrievable.
    if chunks.is_empty() && !code.trim().is_empty() {
        return Ok(chunk_lines(filepath, code, lang.id(), max_chunk_size));
    }
    Ok(chunks)
}

/// Pack sibling nodes greedily until the size limit; recurse into nodes
/// that are individually oversized, extending the scope chain.
fn pack_children(ctx: &AstCtx<'_>, parent: &Node, scope: &str, output: &mut Vec<DraftChunk>) {
    let mut batch: Vec<Node> = Vec::new();
    let mut batch_size = 0usize;

    let mut cursor = parent.walk();
    let children: Vec<Node> = parent.named_children(&mut cursor).collect();

    for child in children {
        let child_len = child.byte_range().len();

        if child_len > ctx.max_chunk_size {
            flush_batch(ctx, &batch, scope, output);
            batch.clear();
            batch_size = 0;

            if child.named_child_count() > 0 {
                let child_scope = extend_scope(scope, &child, ctx.source);
                pack_children(ctx, &child, &child_scope, output);
            } else {
                // Oversized leaf (huge literal, generated blob): line-split
                // its range so nothing is dropped.
                split_oversized_leaf(ctx, &child, scope, output);
            }
            continue;
        }

        if batch_size + child_len > ctx.max_chunk_size && !batch.is_empty() {
            flush_batch(ctx, &batch, scope, output);
            batch.clear();
            batch_size = 0;
        }

        batch.push(child);
        batch_size += child_len;
    }

    flush_batch(ctx, &batch, scope, output);
}

fn flush_batch(ctx: &AstCtx<'_>, batch: &[Node], scope: &str, output: &mut Vec<DraftChunk>) {
    let Some(first) = batch.first() else {
        return;
    };
    let last = batch.last().unwrap_or(first);

    let text = &ctx.source[first.start_byte()..last.end_byte()];
    if text.trim().is_empty() {
        return;
    }

    let entity_kinds = ctx.lang.entity_node_kinds();
    let entities: Vec<String> = batch
        .iter()
        .filter(|n| entity_kinds.contains(&n.kind()))
        .filter_map(|n| entity_name(n, ctx.source))
        .collect();

    output.push(make_chunk(
        ctx.filepath,
        (first.start_position().row + 1) as i64,
        (last.end_position().row + 1) as i64,
        text,
        scope,
        &entities.join(", "),
        ctx.lang.id(),
    ));
}

fn split_oversized_leaf(ctx: &AstCtx<'_>, node: &Node, scope: &str, output: &mut Vec<DraftChunk>) {
    let text = &ctx.source[node.byte_range()];
    let base_line = node.start_position().row as i64;
    for piece in pack_lines(text, ctx.max_chunk_size) {
        output.push(make_chunk(
            ctx.filepath,
            base_line + piece.line_start,
            base_line + piece.line_end,
            &piece.text,
            scope,
            "",
            ctx.lang.id(),
        ));
    }
}

fn entity_name(node: &Node, source: &str) -> Option<String> {
    // tree-sitter-rust impl_item names its target via "type"; most
    // grammars use "name".
    node.child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"))
        .map(|n| source[n.byte_range()].to_string())
}

fn extend_scope(parent_scope: &str, node: &Node, source: &str) -> String {
    let name = entity_name(node, source).unwrap_or_else(|| node.kind().to_string());
    if parent_scope.is_empty() {
        name
    } else {
        format!("{parent_scope} > {name}")
    }
}

struct LinePiece {
    /// 1-based, relative to the packed text.
    line_start: i64,
    line_end: i64,
    text: String,
}

/// Deterministic line-window packing for files without a grammar.
fn pack_lines(code: &str, max_chunk_size: usize) -> Vec<LinePiece> {
    let mut pieces = Vec::new();
    let mut buf: Vec<&str> = Vec::new();
    let mut buf_size = 0usize;
    let mut buf_start = 0i64;

    let flush = |buf: &mut Vec<&str>, buf_start: i64, pieces: &mut Vec<LinePiece>| {
        if buf.iter().all(|l| l.trim().is_empty()) {
            buf.clear();
            return;
        }
        pieces.push(LinePiece {
            line_start: buf_start,
            line_end: buf_start + buf.len() as i64 - 1,
            text: buf.join("\n"),
        });
        buf.clear();
    };

    for (i, line) in code.lines().enumerate() {
        let line_no = i as i64 + 1;
        if buf_size + line.len() + 1 > max_chunk_size && !buf.is_empty() {
            flush(&mut buf, buf_start, &mut pieces);
            buf_size = 0;
        }
        if buf.is_empty() {
            buf_start = line_no;
        }
        buf.push(line);
        buf_size += line.len() + 1;
    }
    flush(&mut buf, buf_start, &mut pieces);

    pieces
}

fn chunk_lines(filepath: &str, code: &str, language: &str, max_chunk_size: usize) -> Vec<DraftChunk> {
    pack_lines(code, max_chunk_size)
        .into_iter()
        .map(|piece| {
            make_chunk(
                filepath,
                piece.line_start,
                piece.line_end,
                &piece.text,
                "",
                "",
                language,
            )
        })
        .collect()
}

fn make_chunk(
    filepath: &str,
    line_start: i64,
    line_end: i64,
    text: &str,
    scope: &str,
    entities: &str,
    language: &str,
) -> DraftChunk {
    let contextualized = contextualize(filepath, scope, entities, language, text);
    let hash = chunk_hash(filepath, line_start, line_end, &contextualized);
    DraftChunk {
        filepath: filepath.to_string(),
        line_start,
        line_end,
        text: text.to_string(),
        contextualized_text: contextualized,
        scope: scope.to_string(),
        entities: entities.to_string(),
        language: language.to_string(),
        hash,
    }
}

/// Build the embedded form: path, scope, entities, and language headers
/// prepended to the raw slice.
#[must_use]
pub fn contextualize(
    filepath: &str,
    scope: &str,
    entities: &str,
    language: &str,
    text: &str,
) -> String {
    let mut out = String::with_capacity(text.len() + 128);
    out.push_str("# ");
    out.push_str(filepath);
    out.push('\n');
    if !scope.is_empty() {
        out.push_str("# Scope: ");
        out.push_str(scope);
        out.push('\n');
    }
    if !entities.is_empty() {
        out.push_str("# Entities: ");
        out.push_str(entities);
        out.push('\n');
    }
    if !language.is_empty() {
        out.push_str("# Language: ");
        out.push_str(language);
        out.push('\n');
    }
    out.push_str(text);
    out
}

/// Content hash binding a chunk to its position and embedded form.
#[must_use]
pub fn chunk_hash(filepath: &str, line_start: i64, line_end: i64, contextualized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filepath.as_bytes());
    hasher.update(b":");
    hasher.update(line_start.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(line_end.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(contextualized.as_bytes());
    format!("{:x}", hasher.finalize())
}
