//! Property tests over random point clouds

use proptest::prelude::*;
use zone_clustering::{
    ClusterConfig, ClusterEngine, CountryPolygon, CountryResolver, LatLon, PointDataset, ZoneAggregator,
};

fn point() -> impl Strategy<Value = LatLon> {
    (-60.0f64..60.0, -120.0f64..120.0).prop_map(|(lat, lon)| LatLon::new(lat, lon))
}

fn points(max: usize) -> impl Strategy<Value = Vec<LatLon>> {
    prop::collection::vec(point(), 1..max)
}

fn square(name: &str, lat: f64, lon: f64, size: f64) -> CountryPolygon {
    CountryPolygon::from_exterior(
        name,
        &[
            LatLon::new(lat, lon),
            LatLon::new(lat, lon + size),
            LatLon::new(lat + size, lon + size),
            LatLon::new(lat + size, lon),
            LatLon::new(lat, lon),
        ],
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_assignment_covers_every_point(pts in points(80), k in 1usize..8, seed in any::<u64>()) {
        prop_assume!(k <= pts.len());
        let fit = ClusterEngine::new(ClusterConfig::exact(k, seed)).unwrap().fit(&pts).unwrap();

        prop_assert_eq!(fit.assignment.len(), pts.len());
        prop_assert!(fit.assignment.labels().iter().all(|&l| l < k));

        let ids: Vec<usize> = fit.centers.iter().map(|c| c.cluster_id).collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(ids, fit.assignment.cluster_ids());

        let members: usize = fit.centers.iter().map(|c| c.member_count).sum();
        prop_assert_eq!(members, pts.len());
    }

    #[test]
    fn test_exact_inertia_never_increases(pts in points(80), k in 1usize..6, seed in any::<u64>()) {
        prop_assume!(k <= pts.len());
        let fit = ClusterEngine::new(ClusterConfig::exact(k, seed)).unwrap().fit(&pts).unwrap();

        for w in fit.inertia_history.windows(2) {
            prop_assert!(w[1] <= w[0] + 1e-9 * w[0].max(1.0), "inertia rose: {:?}", w);
        }
    }

    #[test]
    fn test_k_equals_n_gives_one_cluster_per_distinct_point(pts in points(20), seed in any::<u64>()) {
        let mut distinct = pts.clone();
        distinct.sort_by(|a, b| a.lat.total_cmp(&b.lat).then(a.lon.total_cmp(&b.lon)));
        distinct.dedup();
        prop_assume!(distinct.len() == pts.len());

        let fit = ClusterEngine::new(ClusterConfig::exact(pts.len(), seed)).unwrap().fit(&pts).unwrap();
        prop_assert_eq!(fit.centers.len(), pts.len());
        prop_assert!(fit.inertia() < 1e-12);
    }

    #[test]
    fn test_k_equals_n_zone_means_are_member_values(pts in points(20), seed in any::<u64>()) {
        let mut distinct = pts.clone();
        distinct.sort_by(|a, b| a.lat.total_cmp(&b.lat).then(a.lon.total_cmp(&b.lon)));
        distinct.dedup();
        prop_assume!(distinct.len() == pts.len());

        let quality: Vec<Option<f64>> = (0..pts.len()).map(|i| Some(i as f64 * 1.5)).collect();
        let ds = PointDataset::from_coordinates(pts.iter().map(|p| (p.lat, p.lon)))
            .unwrap()
            .with_numeric_column("quality", quality.clone())
            .unwrap();

        let fit = ClusterEngine::new(ClusterConfig::exact(pts.len(), seed)).unwrap().fit(ds.coordinates()).unwrap();
        let zones = ZoneAggregator::for_dataset(&ds).aggregate(&ds, &fit.assignment, &fit.centers).unwrap();

        prop_assert_eq!(zones.len(), pts.len());
        for (row, &label) in fit.assignment.labels().iter().enumerate() {
            let zone = &zones[label];
            prop_assert_eq!(zone.cluster_id, label);
            prop_assert_eq!(zone.member_count, 1);
            prop_assert_eq!(zone.mean("quality"), quality[row]);
        }
    }

    #[test]
    fn test_single_batch_streaming_matches_exact(pts in points(60), k in 1usize..5, seed in any::<u64>()) {
        prop_assume!(k <= pts.len());
        let exact = ClusterEngine::new(ClusterConfig::exact(k, seed)).unwrap().fit(&pts).unwrap();
        let streaming = ClusterEngine::new(ClusterConfig::streaming(k, pts.len(), seed))
            .unwrap()
            .fit(&pts)
            .unwrap();

        prop_assert_eq!(exact.assignment, streaming.assignment);
        prop_assert_eq!(exact.centers, streaming.centers);
    }

    #[test]
    fn test_aggregate_is_idempotent(pts in points(60), k in 1usize..5, seed in any::<u64>()) {
        prop_assume!(k <= pts.len());
        let quality: Vec<Option<f64>> = (0..pts.len())
            .map(|i| if i % 3 == 0 { None } else { Some(i as f64) })
            .collect();
        let ds = PointDataset::from_coordinates(pts.iter().map(|p| (p.lat, p.lon)))
            .unwrap()
            .with_numeric_column("quality", quality)
            .unwrap();

        let fit = ClusterEngine::new(ClusterConfig::exact(k, seed)).unwrap().fit(ds.coordinates()).unwrap();
        let aggregator = ZoneAggregator::for_dataset(&ds);
        let first = aggregator.aggregate(&ds, &fit.assignment, &fit.centers).unwrap();
        let second = aggregator.aggregate(&ds, &fit.assignment, &fit.centers).unwrap();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.iter().map(|s| s.member_count).sum::<usize>(), pts.len());
    }

    #[test]
    fn test_resolve_many_matches_resolve(pts in points(120)) {
        let resolver = CountryResolver::build(vec![
            square("West", -30.0, -90.0, 50.0),
            square("East", 0.0, 10.0, 40.0),
            square("Overlap", 10.0, 20.0, 40.0),
        ])
        .unwrap();

        let many = resolver.resolve_many(&pts);
        prop_assert_eq!(many.len(), pts.len());
        for (p, country) in pts.iter().zip(&many) {
            prop_assert_eq!(*country, resolver.resolve(p.lat, p.lon));
        }
    }
}
