mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use feedsync::protocol::WireAppend;
    use feedsync::store::FileContentStore;
    use feedsync::{
        EngineConfig, ModelErrorKind, ModelProviderFactory, RequestBehavior, RequestError,
        Response, SessionState, SyncError,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn seeded(cards_in_root: &[i64]) -> anyhow::Result<Harness> {
        let h = harness(RequestBehavior::NoRequestWithContent, TIMEOUT);
        h.requests
            .push_refresh(initial_response(cards_in_root, Some((1, "next"))));
        Ok(h)
    }

    #[tokio::test]
    async fn test_first_session_waits_for_initial_content() -> anyhow::Result<()> {
        let h = seeded(&[1, 2, 3]).await?;

        let provider = h.factory.create_new(None, ui()).await?;
        assert_eq!(provider.current_state(), SessionState::Ready);
        assert_eq!(cards(&provider), card_ids(&[1, 2, 3]));
        assert_eq!(tokens(&provider), vec![token("next")]);
        assert_eq!(h.requests.refresh_calls(), 1);

        // Head has content now; no further request
        let second = h.factory.create_new(None, ui()).await?;
        assert_eq!(cards(&second), card_ids(&[1, 2, 3]));
        assert_ne!(second.get_session_id(), provider.get_session_id());
        assert_eq!(h.requests.refresh_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_fans_out_to_every_session() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let a = h.factory.create_new(None, ui()).await?;
        let b = h.factory.create_new(None, ui()).await?;
        let watch_a = watch_root(&a);
        let watch_b = watch_root(&b);

        h.factory
            .push_response(append_response(&[3, 4], None))
            .await?;

        for watcher in [&watch_a, &watch_b] {
            let changes = watcher.changes();
            assert_eq!(changes.len(), 1);
            let appended: Vec<_> = changes[0]
                .appended_children
                .iter()
                .map(|c| c.content_id.clone())
                .collect();
            assert_eq!(appended, card_ids(&[3, 4]));
            assert!(changes[0].removed_children.is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_one_of_four() -> anyhow::Result<()> {
        let h = seeded(&[1, 2, 3, 4]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let watcher = watch_root(&provider);

        h.factory.push_response(remove_response(&[3])).await?;

        let changes = watcher.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].removed_children.len(), 1);
        assert_eq!(changes[0].removed_children[0].content_id, card_id(3));
        assert_eq!(cards(&provider), card_ids(&[1, 2, 4]));
        Ok(())
    }

    #[tokio::test]
    async fn test_removing_absent_children_is_noop() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let watcher = watch_root(&provider);

        h.factory.push_response(remove_response(&[42, 43])).await?;

        assert_eq!(watcher.count(), 0);
        assert_eq!(cards(&provider), card_ids(&[1, 2]));
        Ok(())
    }

    #[tokio::test]
    async fn test_cursor_sees_appends_made_while_iterating() -> anyhow::Result<()> {
        let h = harness(RequestBehavior::NoRequestWithContent, TIMEOUT);
        h.requests.push_refresh(initial_response(&[1, 2], None));
        let provider = h.factory.create_new(None, ui()).await?;

        let mut cursor = root(&provider).cursor();
        assert_eq!(cursor.next_item().map(|c| c.content_id), Some(card_id(1)));

        h.factory
            .push_response(append_response(&[3, 4], None))
            .await?;

        let rest: Vec<_> = cursor.by_ref().map(|c| c.content_id).collect();
        assert_eq!(rest, card_ids(&[2, 3, 4]));
        assert!(cursor.is_at_end());
        Ok(())
    }

    #[tokio::test]
    async fn test_root_replacement_finishes_session_once() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let lifecycle = watch_lifecycle(&provider);
        assert_eq!(lifecycle.started(), 1);

        let other_root = feedsync::ContentId::new("stream", "feature", 99);
        let replace = Response {
            appends: vec![
                WireAppend {
                    parent: None,
                    children: vec![other_root.clone()],
                },
                WireAppend {
                    parent: Some(other_root),
                    children: vec![card_wire(7)],
                },
            ],
            ..Default::default()
        };
        h.factory.push_response(replace.clone()).await?;
        // The old root is gone, so appending under it is a structure error
        let err = h
            .factory
            .push_response(append_response(&[8], None))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Structure(_)));

        assert_eq!(provider.current_state(), SessionState::Invalidated);
        assert_eq!(lifecycle.finished(), 1);
        assert_eq!(lifecycle.started(), 1);

        // New sessions see the new root
        let fresh = h.factory.create_new(None, ui()).await?;
        assert_eq!(cards(&fresh), card_ids(&[7]));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_root_is_ignored() -> anyhow::Result<()> {
        let h = seeded(&[1]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let lifecycle = watch_lifecycle(&provider);

        let duplicate = Response {
            appends: vec![WireAppend {
                parent: None,
                children: vec![root_wire()],
            }],
            ..Default::default()
        };
        h.factory.push_response(duplicate).await?;

        assert_eq!(provider.current_state(), SessionState::Ready);
        assert_eq!(lifecycle.finished(), 0);
        assert_eq!(cards(&provider), card_ids(&[1]));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_is_terminal_and_fires_once() -> anyhow::Result<()> {
        let h = seeded(&[1]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let lifecycle = watch_lifecycle(&provider);

        provider.invalidate();
        provider.invalidate();
        assert_eq!(provider.current_state(), SessionState::Invalidated);
        assert_eq!(lifecycle.finished(), 1);

        let err = provider.handle_token(&token("next")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidToken(_)));

        // Late registration replays the finished transition only
        let late = watch_lifecycle(&provider);
        assert_eq!(late.started(), 0);
        assert_eq!(late.finished(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_new_replaces_existing_session() -> anyhow::Result<()> {
        let h = seeded(&[1]).await?;
        let first = h.factory.create_new(None, ui()).await?;
        let lifecycle = watch_lifecycle(&first);

        let second = h
            .factory
            .create_new(Some(&first.get_session_id()), ui())
            .await?;

        assert_eq!(first.current_state(), SessionState::Invalidated);
        assert_eq!(lifecycle.finished(), 1);
        assert_eq!(second.current_state(), SessionState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_refresh_on_empty_head_reports_no_cards() -> anyhow::Result<()> {
        let h = harness(RequestBehavior::NoRequestWithContent, TIMEOUT);
        h.requests
            .push_refresh_error(RequestError::Transport("offline".to_string()));

        let provider = h.factory.create_new(None, ui()).await?;
        assert_eq!(provider.current_state(), SessionState::Ready);
        assert!(provider.get_root_feature().is_none());
        assert!(provider.get_all_root_children().is_empty());

        let lifecycle = watch_lifecycle(&provider);
        assert_eq!(lifecycle.started(), 1);
        let errors = lifecycle.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ModelErrorKind::NoCards);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_existing_content() -> anyhow::Result<()> {
        let h = harness(RequestBehavior::RequestWithWait, TIMEOUT);
        h.requests.push_refresh(initial_response(&[1, 2], None));
        let first = h.factory.create_new(None, ui()).await?;
        assert_eq!(cards(&first), card_ids(&[1, 2]));

        h.requests
            .push_refresh_error(RequestError::Status {
                code: 503,
                message: "unavailable".to_string(),
            });
        let second = h.factory.create_new(None, ui()).await?;
        let lifecycle = watch_lifecycle(&second);

        assert_eq!(second.current_state(), SessionState::Ready);
        assert_eq!(cards(&second), card_ids(&[1, 2]));
        assert!(lifecycle.errors().is_empty());
        assert_eq!(h.requests.refresh_calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reattach_errors() -> anyhow::Result<()> {
        let h = seeded(&[1]).await?;
        let provider = h.factory.create_new(None, ui()).await?;

        let err = h.factory.create("session_missing", ui()).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownSession(_)));

        let err = h
            .factory
            .create(&provider.get_session_id(), ui())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionAttached(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_detached_provider_is_silent_until_reattached() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let watcher = watch_root(&provider);

        let session_id = provider.detach_model_provider();
        assert!(!provider.is_attached());
        h.factory.push_response(append_response(&[3], None)).await?;
        assert_eq!(watcher.count(), 0);

        let stats = h.factory.stats().await?;
        assert_eq!(stats.detached_sessions, 1);

        let reattached = h.factory.create(&session_id, ui()).await?;
        assert_eq!(reattached.get_session_id(), session_id);
        assert!(reattached.is_attached());
        assert_eq!(cards(&reattached), card_ids(&[1, 2, 3]));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_disposes_session() -> anyhow::Result<()> {
        let h = seeded(&[1]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let session_id = provider.detach_model_provider();

        assert!(h.factory.release(&session_id).await?);
        assert!(!h.factory.release(&session_id).await?);
        let err = h.factory.create(&session_id, ui()).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownSession(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_content_updates_mark_feature_changed() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let feature = provider
            .get_feature(&card_id(2))
            .expect("card 2 is in the view");
        let watcher = Arc::new(ChangeRecorder::default());
        feature.register_observer(watcher.clone());

        h.factory
            .push_response(content_response(2, b"v2", b"props"))
            .await?;

        let changes = watcher.changes();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].feature_changed);
        assert_eq!(provider.content(&card_id(2))?, Some(b"v2".to_vec()));

        let props = provider.semantic_properties(&[card_id(2), card_id(1)])?;
        assert_eq!(props.len(), 1);
        assert_eq!(props[&card_id(2)], b"props".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_push_is_rejected() -> anyhow::Result<()> {
        let h = seeded(&[1]).await?;
        let provider = h.factory.create_new(None, ui()).await?;
        let before = h.factory.stats().await?;

        let orphan = Response {
            appends: vec![WireAppend {
                parent: Some(card_wire(404)),
                children: vec![card_wire(5)],
            }],
            ..Default::default()
        };
        let err = h.factory.push_response(orphan).await.unwrap_err();
        assert!(matches!(err, SyncError::Structure(_)));

        assert_eq!(h.factory.stats().await?.sequence, before.sequence);
        assert_eq!(provider.current_state(), SessionState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_session_record_survives_restart() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = EngineConfig {
            store_path: Some(temp.path().join("store.lst")),
            ..Default::default()
        };

        let h = harness_with_config(RequestBehavior::NoRequestWithContent, config.clone());
        h.requests.push_refresh(initial_response(&[1, 2], None));
        let provider = h.factory.create_new(None, ui()).await?;
        let session_id = provider.detach_model_provider();
        // Wait for the detach to be processed before stopping
        h.factory.stats().await?;
        h.factory.shutdown().await?;

        let store = FileContentStore::open(temp.path().join("store.lst"))?;
        let restarted = ModelProviderFactory::builder(Arc::new(
            feedsync::ScriptedRequestManager::new(),
        ))
        .store(Arc::new(store))
        .config(config)
        .spawn()?;

        // The new head has not seen the old generation
        let reattached = restarted.create(&session_id, ui()).await?;
        assert_eq!(reattached.get_session_id(), session_id);
        assert_eq!(reattached.current_state(), SessionState::Invalidated);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_from_previous_run_stale_after_reload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = EngineConfig {
            store_path: Some(temp.path().join("store.lst")),
            ..Default::default()
        };

        let h = harness_with_config(RequestBehavior::NoRequestWithContent, config.clone());
        h.requests.push_refresh(initial_response(&[1, 2], None));
        let provider = h.factory.create_new(None, ui()).await?;
        let session_id = provider.detach_model_provider();
        h.factory.stats().await?;
        h.factory.shutdown().await?;

        let store = FileContentStore::open(temp.path().join("store.lst"))?;
        let restarted = ModelProviderFactory::builder(Arc::new(
            feedsync::ScriptedRequestManager::new(),
        ))
        .store(Arc::new(store))
        .config(config)
        .spawn()?;

        // Reload content shaped like the old head: sequence and generation
        // line up with the record, the head itself does not
        restarted
            .push_response(initial_response(&[10, 11], None))
            .await?;
        let before = restarted.stats().await?;
        assert_eq!(before.generation, 1);

        let reattached = restarted.create(&session_id, ui()).await?;
        assert_eq!(reattached.current_state(), SessionState::Invalidated);
        assert_eq!(cards(&reattached), card_ids(&[1, 2]));

        restarted.push_response(append_response(&[12], None)).await?;
        assert_eq!(reattached.current_state(), SessionState::Invalidated);
        assert_eq!(cards(&reattached), card_ids(&[1, 2]));

        // The record is gone once it has been reattached
        let err = restarted.create(&session_id, ui()).await.unwrap_err();
        assert!(matches!(err, SyncError::SessionAttached(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_trimmed_behind_sessions() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let _live = h.factory.create_new(None, ui()).await?;
        for n in 3..8 {
            h.factory.push_response(append_response(&[n], None)).await?;
        }
        // Every session is caught up
        assert_eq!(h.factory.stats().await?.journal_entries, 0);

        let parked = h.factory.create_new(None, ui()).await?;
        let session_id = parked.detach_model_provider();
        h.factory.push_response(append_response(&[8], None)).await?;
        h.factory.push_response(append_response(&[9], None)).await?;
        assert_eq!(h.factory.stats().await?.journal_entries, 2);

        let back = h.factory.create(&session_id, ui()).await?;
        assert_eq!(back.current_state(), SessionState::Ready);
        assert_eq!(cards(&back), card_ids(&[1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert_eq!(h.factory.stats().await?.journal_entries, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_oldest_detached_session_evicted() -> anyhow::Result<()> {
        let config = EngineConfig {
            max_detached_sessions: 1,
            ..Default::default()
        };
        let h = harness_with_config(RequestBehavior::NoRequestWithContent, config);
        h.requests.push_refresh(initial_response(&[1], None));

        let first = h.factory.create_new(None, ui()).await?;
        let second = h.factory.create_new(None, ui()).await?;
        let first_id = first.detach_model_provider();
        let second_id = second.detach_model_provider();
        h.factory.push_response(append_response(&[2], None)).await?;

        let stats = h.factory.stats().await?;
        assert_eq!(stats.detached_sessions, 1);
        // Only the newest detached session still pins the journal
        assert_eq!(stats.journal_entries, 1);
        assert_eq!(first.current_state(), SessionState::Invalidated);

        let err = h.factory.create(&first_id, ui()).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownSession(_)));

        let back = h.factory.create(&second_id, ui()).await?;
        assert_eq!(back.current_state(), SessionState::Ready);
        assert_eq!(cards(&back), card_ids(&[1, 2]));
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_track_requests_and_sessions() -> anyhow::Result<()> {
        let h = seeded(&[1, 2]).await?;
        let _a = h.factory.create_new(None, ui()).await?;
        let b = h.factory.create_new(None, ui()).await?;
        b.detach_model_provider();

        let stats = h.factory.stats().await?;
        assert_eq!(stats.refresh_requests, 1);
        assert_eq!(stats.live_sessions, 1);
        assert_eq!(stats.detached_sessions, 1);
        assert_eq!(stats.generation, 1);
        assert!(!stats.refresh_outstanding);
        // sentinel, root, two cards, token
        assert_eq!(stats.nodes, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_timeout_config_rejected() {
        let requests = Arc::new(feedsync::ScriptedRequestManager::new());
        let result = ModelProviderFactory::spawn(
            requests,
            EngineConfig {
                session_timeout_ms: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
