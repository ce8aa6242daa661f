//! Bucket → treatment assignment over a condition's partitions.

use crate::types::Partition;

/// Returns the treatment of the first partition whose cumulative weight
/// reaches `bucket`, walking partitions in definition order.
///
/// `bucket` is expected in 1..=100 and partition weights to sum to 100; a
/// bucket past the cumulative total yields `None` and the caller falls back
/// to the default treatment.
pub fn treatment_for_bucket(bucket: i64, partitions: &[Partition]) -> Option<&str> {
    let mut covered: i64 = 0;
    for partition in partitions {
        covered += partition.size;
        if covered >= bucket {
            return Some(&partition.treatment);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(weights: &[(&str, i64)]) -> Vec<Partition> {
        weights
            .iter()
            .map(|(t, size)| Partition {
                treatment: (*t).to_string(),
                size: *size,
            })
            .collect()
    }

    #[test]
    fn boundaries_fall_on_cumulative_weights() {
        let parts = partitions(&[("on", 10), ("off", 90)]);
        assert_eq!(treatment_for_bucket(1, &parts), Some("on"));
        assert_eq!(treatment_for_bucket(10, &parts), Some("on"));
        assert_eq!(treatment_for_bucket(11, &parts), Some("off"));
        assert_eq!(treatment_for_bucket(100, &parts), Some("off"));
    }

    #[test]
    fn zero_weight_partitions_are_skipped() {
        let parts = partitions(&[("a", 0), ("b", 100)]);
        assert_eq!(treatment_for_bucket(1, &parts), Some("b"));
        assert_eq!(treatment_for_bucket(100, &parts), Some("b"));
    }

    #[test]
    fn single_partition_takes_everything() {
        let parts = partitions(&[("on", 100)]);
        for bucket in 1..=100 {
            assert_eq!(treatment_for_bucket(bucket, &parts), Some("on"));
        }
    }

    #[test]
    fn bucket_past_total_weight_is_none() {
        let parts = partitions(&[("on", 50)]);
        assert_eq!(treatment_for_bucket(51, &parts), None);
        assert_eq!(treatment_for_bucket(1, &[]), None);
    }
}
