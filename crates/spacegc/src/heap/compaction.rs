//! Structural compactions: homogeneous space compaction and the zygote
//! split.

use std::cell::OnceCell;
use std::sync::Arc;

use tracing::{debug, info};

use super::spaces::{MainSpaces, Spaces};
use super::Heap;
use crate::accounting::mod_union_table::ModUnionTable;
use crate::accounting::remembered_set::RememberedSet;
use crate::address::allocation_size;
use crate::collector::{mark_alloc_stack_as_live, BinPacker, CollectorType, GcCause, GcType};
use crate::error::CompactError;
use crate::space::{AllocSpace, BumpPointerSpace, Space};

impl Heap {
    /// Copies every live object of the main free-list space into its empty
    /// backup and swaps the two, removing fragmentation.
    ///
    /// # Errors
    ///
    /// [`CompactError::Unsupported`] for the semi-space family, which has
    /// no backup space; [`CompactError::Rejected`] while moving collections
    /// are disabled; [`CompactError::ShuttingDown`] during shutdown.
    pub fn perform_homogeneous_space_compact(&self) -> Result<(), CompactError> {
        if !matches!(self.spaces().main, MainSpaces::FreeList { .. }) {
            return Err(CompactError::Unsupported);
        }
        if let Err(err) = self.start_gc(
            CollectorType::HomogeneousSpaceCompact,
            GcCause::HomogeneousSpaceCompact,
        ) {
            if err == CompactError::Rejected {
                self.metrics.record_homogeneous_compaction(false);
            }
            return Err(err);
        }

        let before = self.get_bytes_allocated();
        let outcome = self.run_collector(
            CollectorType::HomogeneousSpaceCompact,
            GcType::Full,
            false,
            |collector, spaces| {
                if let (Some(ss), MainSpaces::FreeList { main, backup }) =
                    (collector.as_semi_space_mut(), &spaces.main)
                {
                    ss.set_from_space(main.clone());
                    ss.set_to_space(backup.clone());
                    ss.set_fallback_space(Some(spaces.non_moving.clone()));
                }
            },
            |_, spaces, _| {
                self.publish_spaces(
                    Spaces {
                        main: spaces.main.swapped(),
                        ..spaces.clone()
                    },
                    true,
                );
            },
        );
        self.record_free(&outcome.iteration);
        self.record_gc(
            GcCause::HomogeneousSpaceCompact,
            CollectorType::HomogeneousSpaceCompact,
            GcType::Full,
            &outcome,
        );
        self.metrics.record_homogeneous_compaction(true);
        self.finish_gc(GcType::Full);
        info!(
            before,
            after = self.get_bytes_allocated(),
            pause = ?outcome.pause,
            main_space = %self.spaces().main.main().name(),
            "homogeneous space compaction"
        );
        Ok(())
    }

    /// Splits the non-moving space before the first fork.
    ///
    /// Runs a full collection, then packs every object of the main space
    /// into the gaps of the non-moving space and a bump-pointer region past
    /// its end. Everything up to there becomes the zygote space, immune to
    /// sticky and partial collections; the rest becomes a fresh non-moving
    /// space.
    ///
    /// Returns `false` if a zygote space already exists, moving collections
    /// are disabled or the heap is shutting down.
    pub fn pre_zygote_fork(&self) -> bool {
        self.collect_internal(GcType::Full, GcCause::Background, false);
        let _creation = self.zygote_creation.lock();
        if self.has_zygote_space() {
            return false;
        }
        if self
            .start_gc(CollectorType::ZygoteCompact, GcCause::CollectorTransition)
            .is_err()
        {
            return false;
        }

        let target: OnceCell<Arc<BumpPointerSpace>> = OnceCell::new();
        let outcome = self.run_collector(
            CollectorType::ZygoteCompact,
            GcType::Full,
            false,
            |collector, spaces| {
                let non_moving = &spaces.non_moving;
                let Some(bitmaps) = non_moving.bitmaps() else { return };
                // Objects allocated since the last collection occupy space too.
                mark_alloc_stack_as_live(spaces, self.live_stack());
                let bins = BinPacker::build(&bitmaps.live(), non_moving.begin(), non_moving.end(), |obj| {
                    allocation_size(self.size_of(obj))
                });
                debug!(bins = bins.len(), bytes = bins.remaining_bytes(), "built zygote bins");
                let bump = Arc::new(BumpPointerSpace::new(
                    "zygote bump space",
                    Arc::clone(&self.mem),
                    non_moving.end(),
                    non_moving.limit(),
                ));
                let _ = target.set(Arc::clone(&bump));
                if let Some(ss) = collector.as_semi_space_mut() {
                    ss.set_from_space(spaces.main.main());
                    ss.set_to_space(bump);
                    ss.set_fallback_space(None);
                    ss.set_bins(bins);
                }
            },
            |collector, spaces, _| {
                if let Some(bins) = collector.as_semi_space_mut().and_then(|ss| ss.take_bins()) {
                    debug!(unused_bin_bytes = bins.remaining_bytes(), "packed zygote bins");
                }
                let Some(bump) = target.get() else {
                    spaces.dump_to_log();
                    panic!("zygote compaction ran without a target space");
                };
                self.publish_spaces(self.split_zygote(spaces, bump), true);
            },
        );
        self.record_free(&outcome.iteration);
        self.record_gc(
            GcCause::CollectorTransition,
            CollectorType::ZygoteCompact,
            GcType::Full,
            &outcome,
        );
        self.finish_gc(GcType::Full);
        let spaces = self.spaces();
        info!(
            zygote_objects = spaces.zygote.as_ref().map_or(0, |z| z.objects_allocated()),
            zygote_size = spaces.zygote.as_ref().map_or(0, |z| z.size()),
            pause = ?outcome.pause,
            "created zygote space"
        );
        true
    }

    /// Turns the compacted non-moving space into the zygote space and a new
    /// non-moving space. Mutators must be suspended.
    fn split_zygote(&self, spaces: &Spaces, bump: &BumpPointerSpace) -> Spaces {
        let non_moving = &spaces.non_moving;
        if let Some(bitmaps) = non_moving.bitmaps() {
            let live = bitmaps.live();
            bump.walk(self.model(), &mut |obj| {
                live.set(obj.addr());
            });
        }
        if let Some(set) = &spaces.non_moving_remembered_set {
            set.assert_all_dirty_cards_within_space();
        }
        let (zygote, fresh) = match non_moving.create_zygote_space(bump.end(), "non moving space") {
            Ok(split) => split,
            Err(err) => {
                spaces.dump_to_log();
                panic!("failed to create zygote space: {err}");
            }
        };
        fresh.set_footprint_limit(fresh.capacity());

        let zygote_table = ModUnionTable::new("zygote space mod-union table", zygote.begin(), zygote.limit());
        // Any zygote object may reference a large object.
        zygote_table.set_cards();
        spaces.large_objects.set_all_large_objects_as_zygote_objects();
        let non_moving_remembered_set = spaces.non_moving_remembered_set.as_ref().map(|_| {
            Arc::new(RememberedSet::new(
                "non moving space remembered set",
                fresh.begin(),
                fresh.limit(),
            ))
        });
        Spaces {
            zygote: Some(Arc::new(zygote)),
            non_moving: Arc::new(fresh),
            non_moving_remembered_set,
            zygote_mod_union_table: Some(Arc::new(zygote_table)),
            ..spaces.clone()
        }
    }
}
