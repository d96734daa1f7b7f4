//! Property-based tests for stream combining and line splitting
//!
//! - Line splitting is independent of how bytes are chunked
//! - Combining keeps every item and each source's order

use cutexe::{combine_streams, split_lines};
use futures::executor::block_on;
use futures::stream::{self, StreamExt};
use proptest::prelude::*;

// Strategy for lines without terminators
fn line_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _.-]{1,20}"
}

fn chunk_at(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts
        .iter()
        .map(|c| c % (bytes.len() + 1))
        .collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();
    points
        .windows(2)
        .map(|w| bytes[w[0]..w[1]].to_vec())
        .collect()
}

#[test]
fn prop_split_lines_ignores_chunking() {
    proptest!(|(
        lines in prop::collection::vec(line_strategy(), 1..20),
        cuts in prop::collection::vec(any::<usize>(), 0..10),
        trailing in any::<bool>(),
        crlf in any::<bool>(),
    )| {
        let sep = if crlf { "\r\n" } else { "\n" };
        let mut text = lines.join(sep);
        if trailing {
            text.push_str(sep);
        }

        let chunks = chunk_at(text.as_bytes(), &cuts);
        let out: Vec<String> = block_on(split_lines(stream::iter(chunks)).collect());
        prop_assert_eq!(out, lines);
    });
}

#[test]
fn prop_combine_keeps_per_source_order() {
    proptest!(|(
        sizes in prop::collection::vec(0usize..30, 1..6),
    )| {
        let sources: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(source, &n)| stream::iter((0..n).map(move |i| (source, i))))
            .collect();

        let merged: Vec<(usize, usize)> = block_on(combine_streams(sources).collect());
        prop_assert_eq!(merged.len(), sizes.iter().sum::<usize>());

        for (source, &n) in sizes.iter().enumerate() {
            let seen: Vec<usize> = merged
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, i)| *i)
                .collect();
            prop_assert_eq!(seen, (0..n).collect::<Vec<_>>());
        }
    });
}
