//! Property tests for access splitting and the diagnostic block image

use proptest::prelude::*;
use txf_core::{
    line_spans, page_address, Tdb, TDB_SIZE, ZCACHE_LINE_SHIFT, ZPAGEFRAME_PAGESIZE,
};

proptest! {
    #[test]
    fn spans_cover_the_access_contiguously(address in any::<u64>(), len in 0usize..3 * ZPAGEFRAME_PAGESIZE) {
        let spans = line_spans(address, len);
        prop_assert_eq!(spans.iter().map(|s| s.len).sum::<usize>(), len);

        let mut expected_offset = 0;
        for span in &spans {
            prop_assert_eq!(span.buffer_offset, expected_offset);
            prop_assert_eq!(span.page, page_address(span.page));
            prop_assert!(span.len > 0);
            prop_assert!(span.offset + span.len <= ZPAGEFRAME_PAGESIZE);
            prop_assert_eq!(span.first_line, span.offset >> ZCACHE_LINE_SHIFT);
            prop_assert_eq!(span.last_line, (span.offset + span.len - 1) >> ZCACHE_LINE_SHIFT);
            expected_offset += span.len;
        }
        for pair in spans.windows(2) {
            prop_assert_eq!(pair[1].offset, 0);
            prop_assert_eq!(pair[0].offset + pair[0].len, ZPAGEFRAME_PAGESIZE);
        }
    }

    #[test]
    fn any_image_decodes_and_reencodes_unchanged(image in prop::collection::vec(any::<u8>(), TDB_SIZE)) {
        let tdb = Tdb::from_bytes(&image).unwrap();
        prop_assert_eq!(tdb.to_bytes().to_vec(), image);
    }

    #[test]
    fn wrong_sized_images_are_rejected(len in 0usize..512) {
        prop_assume!(len != TDB_SIZE);
        prop_assert!(Tdb::from_bytes(&vec![0u8; len]).is_err());
    }
}
