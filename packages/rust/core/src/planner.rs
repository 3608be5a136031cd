//! Chunk planning: order-preserving partition of the input collection.

use std::path::Path;

use tracing::{info, instrument, warn};

use cardpipe_shared::{CardpipeError, Result};

use crate::artifacts::{self, ArtifactLayout, ChunkPaths};

/// One independently addressable unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position in the plan.
    pub index: usize,
    /// Number of items in the chunk.
    pub len: usize,
    pub paths: ChunkPaths,
}

/// Split `items` into consecutive slices of at most `chunk_size`.
///
/// Concatenating the result reproduces `items`; only the last slice may be
/// shorter. A zero `chunk_size` yields a single slice holding everything.
pub fn partition<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    if chunk_size == 0 {
        return vec![items.to_vec()];
    }
    items.chunks(chunk_size).map(<[T]>::to_vec).collect()
}

/// Read the input collection and lay it out as chunks.
///
/// With `chunk_size > 0` each chunk's items are written to its own input
/// artifact. With `chunk_size == 0` the input file is used as-is as a single
/// chunk. An empty collection yields an empty plan.
#[instrument(skip_all, fields(input = %layout.input.display(), chunk_size = chunk_size))]
pub fn plan(layout: &ArtifactLayout, chunk_size: usize) -> Result<Vec<Chunk>> {
    let items = artifacts::read_json_array(&layout.input)?;
    info!(total_items = items.len(), "read input collection");

    if items.is_empty() {
        warn!("input collection is empty, no chunks to create");
        return Ok(Vec::new());
    }

    if chunk_size == 0 {
        return Ok(vec![Chunk {
            index: 1,
            len: items.len(),
            paths: layout.whole(),
        }]);
    }

    let total = items.len();
    let mut chunks = Vec::new();
    for (offset, part) in partition(&items, chunk_size).into_iter().enumerate() {
        let index = offset + 1;
        let paths = layout.chunk(index);
        artifacts::write_json(&paths.input, &part)?;

        let first = offset * chunk_size + 1;
        let last = (first + part.len() - 1).min(total);
        info!(
            chunk = index,
            file = %paths.input.display(),
            first,
            last,
            items = part.len(),
            "created chunk"
        );

        chunks.push(Chunk {
            index,
            len: part.len(),
            paths,
        });
    }

    info!(chunks = chunks.len(), "chunk plan ready");
    Ok(chunks)
}

/// Split a JSON array file into `{stem}-{k}.json` parts beside it.
///
/// Returns the created part paths. The source is removed afterwards when
/// `remove_source` is set and at least one part was written.
pub fn split_file(
    input: &Path,
    chunk_size: usize,
    remove_source: bool,
) -> Result<Vec<std::path::PathBuf>> {
    if chunk_size == 0 {
        return Err(CardpipeError::invalid_input("chunk size must be at least 1"));
    }
    let layout = ArtifactLayout::new(input, input, input);
    let parts: Vec<_> = plan(&layout, chunk_size)?
        .into_iter()
        .map(|chunk| chunk.paths.input)
        .collect();

    if remove_source && !parts.is_empty() {
        std::fs::remove_file(input).map_err(|e| CardpipeError::io(input, e))?;
        info!(path = %input.display(), "removed source file");
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::{Value, json};

    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cardpipe-planner-test-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn layout_in(dir: &Path) -> ArtifactLayout {
        ArtifactLayout::new(
            dir.join("input.json"),
            dir.join("out/output.json"),
            dir.join("out/output_raw.log"),
        )
    }

    fn notes(n: i64) -> Vec<Value> {
        (1..=n).map(|id| json!({ "noteId": id, "Question": format!("q{id}") })).collect()
    }

    #[test]
    fn partition_preserves_order_and_bounds() {
        let items: Vec<u32> = (0..103).collect();
        for size in [1, 2, 7, 25, 103, 500] {
            let parts = partition(&items, size);
            assert!(parts.iter().all(|p| p.len() <= size && !p.is_empty()));
            assert!(parts[..parts.len() - 1].iter().all(|p| p.len() == size));
            let flat: Vec<u32> = parts.concat();
            assert_eq!(flat, items);
        }
    }

    #[test]
    fn partition_edge_cases() {
        assert!(partition::<u8>(&[], 25).is_empty());
        assert_eq!(partition(&[1, 2, 3], 0), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn plan_writes_chunk_inputs() {
        let dir = temp_dir();
        let layout = layout_in(&dir);
        artifacts::write_json(&layout.input, &notes(60)).unwrap();

        let chunks = plan(&layout, 25).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.len).collect::<Vec<_>>(), vec![25, 25, 10]);
        assert_eq!(chunks[2].paths.input, dir.join("input-3.json"));
        assert_eq!(chunks[2].paths.output, dir.join("out/output-3.json"));

        let third = artifacts::read_json_array(&chunks[2].paths.input).unwrap();
        assert_eq!(third[0]["noteId"], 51);

        let rebuilt: Vec<Value> = chunks
            .iter()
            .flat_map(|c| artifacts::read_json_array(&c.paths.input).unwrap())
            .collect();
        assert_eq!(rebuilt, notes(60));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_input_plans_nothing() {
        let dir = temp_dir();
        let layout = layout_in(&dir);
        std::fs::write(&layout.input, "[]").unwrap();

        assert!(plan(&layout, 25).unwrap().is_empty());
        assert!(!dir.join("input-1.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn zero_chunk_size_uses_input_directly() {
        let dir = temp_dir();
        let layout = layout_in(&dir);
        artifacts::write_json(&layout.input, &notes(3)).unwrap();

        let chunks = plan(&layout, 0).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].paths, layout.whole());
        assert!(!dir.join("input-1.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn non_array_input_is_invalid() {
        let dir = temp_dir();
        let layout = layout_in(&dir);
        std::fs::write(&layout.input, r#"{"noteId": 1}"#).unwrap();

        let err = plan(&layout, 25).unwrap_err();
        assert!(matches!(err, CardpipeError::InvalidInput { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn split_file_can_remove_source() {
        let dir = temp_dir();
        let input = dir.join("deck.json");
        artifacts::write_json(&input, &notes(5)).unwrap();

        let parts = split_file(&input, 2, true).unwrap();
        assert_eq!(
            parts,
            vec![dir.join("deck-1.json"), dir.join("deck-2.json"), dir.join("deck-3.json")]
        );
        assert!(!input.exists());
        assert!(split_file(&dir.join("deck-1.json"), 0, false).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
