//! Ingestion through context assembly, end to end.

use crate::helpers::{knowledge, rag_config};
use colloquy::config::EmbeddingConfig;
use colloquy::error::ChatError;
use colloquy::rag::embedding::OllamaEmbedder;
use colloquy::rag::{
    ContextAssembler, Document, Embedder, HashingEmbedder, KnowledgeBase, SourceType, VectorIndex,
    estimate_tokens,
};
use std::sync::Arc;

const P1: &str = "Rust ownership rules prevent data races while compiling code.";
const P2: &str = "Photosynthesis converts sunlight into chemical energy in leaves.";
const P3: &str = "The harbor ferry departs every hour toward the northern islands.";

fn three_paragraphs() -> String {
    format!("{P1}\n\n{P2}\n\n{P3}")
}

#[tokio::test]
async fn query_matching_second_paragraph_returns_its_fragment() {
    let kb = knowledge(Arc::new(HashingEmbedder::new(256)));
    let text = three_paragraphs();
    let report = kb
        .ingest(Document::new("guide", "guide.md", SourceType::Markdown, text.clone()))
        .await
        .unwrap();
    assert!(report.fragments >= 3);

    let p2_start = text.find(P2).unwrap();
    let p2_end = p2_start + P2.len();

    let query = kb.embedder().embed(P2).await.unwrap();
    let results = kb.index().query(&query, 3).unwrap();
    let top = &results[0];
    assert!(
        top.fragment.start <= p2_start && top.fragment.end >= p2_end,
        "top fragment {}..{} does not cover paragraph 2 ({p2_start}..{p2_end})",
        top.fragment.start,
        top.fragment.end
    );
    assert!(top.fragment.text.contains(P2));

    let context = kb.assemble(P2).await.unwrap();
    assert!(context.block.starts_with("### Source: guide.md\n"));
    assert!(context.block.contains(P2));
}

#[tokio::test]
async fn empty_index_yields_empty_block_without_embedding() {
    // Unreachable embedder: any call would fail.
    let embedder = OllamaEmbedder::new(&EmbeddingConfig {
        api_url: "http://127.0.0.1:1".into(),
        timeout_secs: 1,
        ..Default::default()
    })
    .unwrap();
    let kb = KnowledgeBase::new(rag_config(), Arc::new(embedder)).unwrap();

    let context = kb.assemble("anything at all").await.unwrap();
    assert!(context.is_empty());
    assert!(context.fragments.is_empty());
    assert_eq!(context.estimated_tokens, 0);
}

#[tokio::test]
async fn assembled_context_respects_every_budget() {
    let kb = knowledge(Arc::new(HashingEmbedder::new(256)));
    for (i, topic) in ["ferries", "harbors", "islands", "tides"].iter().enumerate() {
        let text = format!(
            "Notes about {topic}. The northern {topic} are busy in summer.\n\n\
             Schedules for {topic} change every season and ferry crews adapt."
        );
        kb.ingest(Document::new(
            format!("doc-{i}"),
            format!("{topic}.txt"),
            SourceType::PlainText,
            text,
        ))
        .await
        .unwrap();
    }

    let assembler: ContextAssembler = kb.assembler();
    for budget in [0, 5, 20, 40, 80, 4000] {
        let context = assembler
            .assemble("when do the ferries leave", budget)
            .await
            .unwrap();
        assert!(
            context.estimated_tokens <= budget,
            "budget {budget} exceeded: {}",
            context.estimated_tokens
        );
        assert_eq!(context.estimated_tokens, estimate_tokens(&context.block));
        if budget == 0 {
            assert!(context.is_empty());
        }
    }
}

#[tokio::test]
async fn mismatched_embedder_leaves_index_intact() {
    let index = Arc::new(VectorIndex::new(0));
    let wide = KnowledgeBase::with_index(
        rag_config(),
        Arc::new(HashingEmbedder::new(256)),
        Arc::clone(&index),
    )
    .unwrap();
    wide.ingest(Document::new("a", "a.txt", SourceType::PlainText, three_paragraphs()))
        .await
        .unwrap();
    let before = index.fragment_ids();

    let narrow: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
    let drifted = KnowledgeBase::with_index(rag_config(), narrow, Arc::clone(&index)).unwrap();
    let err = drifted
        .ingest(Document::new("b", "b.txt", SourceType::PlainText, "Other text entirely."))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ChatError::DimensionMismatch {
            expected: 256,
            actual: 64
        }
    ));
    assert_eq!(index.fragment_ids(), before);
    assert_eq!(index.documents().len(), 1);
}

#[tokio::test]
async fn saved_index_answers_like_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");

    let kb = knowledge(Arc::new(HashingEmbedder::new(128)));
    kb.ingest(Document::new("guide", "guide.md", SourceType::Markdown, three_paragraphs()))
        .await
        .unwrap();
    kb.index().save_to_file(&path).unwrap();

    let restored = Arc::new(VectorIndex::load_from_file(&path, 0).unwrap());
    let reopened = KnowledgeBase::with_index(
        rag_config(),
        Arc::new(HashingEmbedder::new(128)),
        restored,
    )
    .unwrap();

    let original = kb.assemble(P3).await.unwrap();
    let loaded = reopened.assemble(P3).await.unwrap();
    assert_eq!(original.block, loaded.block);
    assert_eq!(reopened.documents().len(), 1);
}
