//! Integration Tests for the Cell Runtime
//!
//! These tests verify that signals, channels, and cells work together
//! end to end: values fed before start, cells piped to each other,
//! streamed elements under acknowledgement, and the lifecycle
//! transitions a cell moves through.

use std::sync::Arc;

use weft_core::cells::{CellKind, CellStatus, LabEnv};
use weft_core::errors::CellError;

/// Test a complete single-cell round trip: a value fed before start
/// opens the input gate, a bound output follows the input reactively,
/// and an out-stream delivers elements until the cell finishes.
#[tokio::test]
async fn reverser_cell_end_to_end() {
    let env = LabEnv::new();
    let kind = CellKind::new("reverser")
        .input("prefix")
        .output("reversed")
        .out_stream("names");

    let cell = env
        .spawn("reverser", kind, |scope| async move {
            let prefix = scope.input::<String>("prefix").await?;
            let reversed = {
                let prefix = prefix.clone();
                scope
                    .space()
                    .derived(move || prefix.get().chars().rev().collect::<String>())?
            };
            scope.bind_output("reversed", reversed)?;

            let names = scope.out_stream::<String>("names")?;
            for i in 0..3 {
                names.send(&format!("{} name_{i}", prefix.get_untracked())).await?;
            }

            scope.finish_requested().await;
            Ok(())
        })
        .unwrap();

    // Feed the input and attach the stream reader before the cell
    // starts; both are queued and applied in order at start.
    let writer = cell.input::<String>("prefix").unwrap();
    writer.set(&String::from("Foo")).unwrap();
    let names = cell.out_stream::<String>("names").unwrap();

    cell.start().await.unwrap();
    assert_eq!(cell.status(), CellStatus::Running);

    let mut reversed = cell.output::<String>("reversed").unwrap();
    reversed.ready().await;
    assert_eq!(reversed.get().as_deref(), Some("ooF"));

    assert_eq!(names.next().await.as_deref(), Some("Foo name_0"));
    assert_eq!(names.next().await.as_deref(), Some("Foo name_1"));
    assert_eq!(names.next().await.as_deref(), Some("Foo name_2"));

    // A later write flows through the same bound output.
    writer.set(&String::from("Bar")).unwrap();
    assert_eq!(reversed.changed().await.as_deref(), Some("raB"));

    cell.request_finish();
    cell.finished().await;
    assert_eq!(cell.status(), CellStatus::Stopped);

    // Teardown ended the stream.
    assert_eq!(names.next().await, None);
}

/// Test that two cells can be piped together before either has
/// started: the sink's input gate opens on the source's first
/// publication.
#[tokio::test]
async fn cells_piped_before_start_exchange_first_values() {
    let env = LabEnv::new();

    let source = env
        .spawn(
            "source",
            CellKind::new("source").output("word"),
            |scope| async move {
                scope.output::<String>("word")?.set(&String::from("weft"))?;
                scope.finish_requested().await;
                Ok(())
            },
        )
        .unwrap();

    let sink = env
        .spawn(
            "sink",
            CellKind::new("sink").input("word").output("len"),
            |scope| async move {
                let word = scope.input::<String>("word").await?;
                let len = {
                    let word = word.clone();
                    scope.space().derived(move || word.get().len() as i64)?
                };
                scope.bind_output("len", len)?;
                scope.finish_requested().await;
                Ok(())
            },
        )
        .unwrap();

    sink.pipe_input_from("word", &source, "word").unwrap();

    // Starting is concurrent: the sink waits on the source's output.
    env.start_all().await.unwrap();

    let mut len = sink.output::<i64>("len").unwrap();
    len.ready().await;
    assert_eq!(len.get(), Some(4));

    env.shutdown().await;
    assert!(env.is_empty());
}

/// Test a stream piped between cells: the consumer reads elements
/// until the producer's teardown ends the stream, then publishes a
/// result of its own.
#[tokio::test]
async fn a_piped_stream_drains_and_ends_with_the_producer() {
    let env = LabEnv::new();

    let producer = env
        .spawn(
            "producer",
            CellKind::new("producer").out_stream("nums"),
            |scope| async move {
                let nums = scope.out_stream::<i64>("nums")?;
                for n in 1..=3 {
                    nums.send(&n).await?;
                }
                // Returning ends the stream during teardown.
                Ok(())
            },
        )
        .unwrap();

    let consumer = env
        .spawn(
            "consumer",
            CellKind::new("consumer").in_stream("nums").output("total"),
            |scope| async move {
                let nums = scope.in_stream::<i64>("nums")?;
                let total_out = scope.output::<i64>("total")?;
                let mut total = 0;
                while let Some(n) = nums.next().await {
                    total += n;
                }
                total_out.set(&total)?;
                Ok(())
            },
        )
        .unwrap();

    let mut total = consumer.output::<i64>("total").unwrap();
    consumer
        .pipe_in_stream_from("nums", &producer, "nums")
        .unwrap();

    env.start_all().await.unwrap();

    total.ready().await;
    assert_eq!(total.get(), Some(6));

    producer.finished().await;
    consumer.finished().await;
}

/// Test the lifecycle transitions in order. Each asserted state is
/// stable until the test itself advances the cell, so none of them can
/// be skipped over.
#[tokio::test]
async fn status_moves_through_the_documented_transitions() {
    let env = LabEnv::new();
    let kind = CellKind::new("stages").input("go").in_stream("release");

    let cell = env
        .spawn("stages", kind, |scope| async move {
            scope.finish_requested().await;
            // Hold in Stopping until the release element arrives.
            let release = scope.in_stream::<bool>("release")?;
            release.next().await;
            Ok::<(), CellError>(())
        })
        .unwrap();

    let mut status = cell.status_updates();
    assert_eq!(*status.borrow_and_update(), CellStatus::NotStarted);

    let go = cell.input::<bool>("go").unwrap();
    let release = cell.in_stream::<bool>("release").unwrap();

    let starter = {
        let cell = Arc::clone(&cell);
        tokio::spawn(async move { cell.start().await })
    };

    status
        .wait_for(|s| *s == CellStatus::StartingWaitingForInputs)
        .await
        .unwrap();

    go.set(&true).unwrap();
    status
        .wait_for(|s| *s == CellStatus::Running)
        .await
        .unwrap();
    starter.await.unwrap().unwrap();

    cell.request_finish();
    status
        .wait_for(|s| *s == CellStatus::Stopping)
        .await
        .unwrap();

    release.send(&true).await.unwrap();
    status
        .wait_for(|s| *s == CellStatus::Stopped)
        .await
        .unwrap();
    assert!(cell.status().is_stopped());
}
