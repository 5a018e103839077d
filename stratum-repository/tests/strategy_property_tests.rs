//! Property-Based Tests for Strategy Gating
//!
//! For any non-empty strategy, an insert lands in exactly the tiers the
//! strategy selects, and a removal with the same strategy clears them again.

use proptest::prelude::*;
use stratum_core::{QueryStrategy, RepositoryOptions, Tier};
use stratum_test_utils::assertions::tier_contains;
use stratum_test_utils::fixtures::MemoryTiers;
use stratum_test_utils::generators::{arb_document, arb_nonempty_strategy, arb_uuid};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_insert_lands_in_selected_tiers(
        id in arb_uuid(),
        doc in arb_document(),
        strategy in arb_nonempty_strategy(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let tiers = MemoryTiers::new();
            let pipeline = tiers.pipeline(None).unwrap();
            let repo = pipeline
                .repository("props", &RepositoryOptions::default())
                .await
                .unwrap();

            repo.insert(id, &doc, strategy).await.unwrap();
            for tier in Tier::ALL {
                let held = tier_contains(tiers.store(tier), "props", id).await;
                prop_assert_eq!(held, strategy.targets(tier), "tier {}", tier);
            }

            prop_assert!(repo.remove(id, strategy).await.unwrap());
            for tier in strategy.tiers() {
                prop_assert!(!tier_contains(tiers.store(tier), "props", id).await);
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_stored_document_reads_back(id in arb_uuid(), doc in arb_document()) {
        let rt = runtime();
        rt.block_on(async {
            let tiers = MemoryTiers::new();
            let pipeline = tiers.pipeline(None).unwrap();
            let repo = pipeline
                .repository("props", &RepositoryOptions::default())
                .await
                .unwrap();

            repo.insert(id, &doc, QueryStrategy::GLOBAL_STORAGE).await.unwrap();
            prop_assert_eq!(repo.get(id).await.unwrap(), Some(doc));
            Ok(())
        })?;
    }
}
