#[cfg(test)]
mod locking_tests {
    use std::sync::Arc;

    use crate::StressConfig;
    use crate::operation::Operation;
    use crate::partition::{KeyDistribution, PartitionKey};
    use crate::session::{ResultSet, Row, Value};
    use crate::testing;
    use crate::workload::{Locking, PopulateOption, WorkloadProfile, WorkloadRunner};

    #[derive(Debug)]
    struct Applied(bool);

    impl ResultSet for Applied {
        fn rows(&self) -> &[Row] {
            &[]
        }

        fn was_applied(&self) -> bool {
            self.0
        }
    }

    fn runner() -> Arc<dyn WorkloadRunner> {
        let profile = Locking::default();
        let (session, ctx) = testing::context();
        profile.prepare(session.as_ref()).unwrap();
        profile.runner(&ctx).unwrap()
    }

    /// (new status, guard status) of a status flip.
    fn flip(op: &Operation) -> (i64, i64) {
        match op {
            Operation::Mutation { statement, payload, .. } => {
                let values = statement.values();
                assert_eq!(payload.as_ref(), Some(&values[0]));
                (values[0].as_int().unwrap(), values[2].as_int().unwrap())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn applied_flip_advances_state() {
        let runner = runner();
        let key = PartitionKey::new("001.0.", 1);

        let first = runner.next_mutation(&key);
        assert_eq!(flip(&first), (1, 0));

        runner.on_success(&first, &Applied(true));
        let second = runner.next_mutation(&key);
        assert_eq!(flip(&second), (0, 1));

        runner.on_success(&second, &Applied(true));
        assert_eq!(flip(&runner.next_mutation(&key)), (1, 0));
    }

    #[test]
    fn rejected_flip_keeps_state() {
        let runner = runner();
        let key = PartitionKey::new("001.0.", 2);

        let op = runner.next_mutation(&key);
        runner.on_success(&op, &Applied(false));
        assert_eq!(flip(&runner.next_mutation(&key)), (1, 0));
    }

    #[test]
    fn state_is_per_key() {
        let runner = runner();
        let a = PartitionKey::new("001.0.", 1);
        let b = PartitionKey::new("001.0.", 2);

        let op = runner.next_mutation(&a);
        runner.on_success(&op, &Applied(true));
        assert_eq!(flip(&runner.next_mutation(&a)), (0, 1));
        assert_eq!(flip(&runner.next_mutation(&b)), (1, 0));
    }

    #[test]
    fn populate_inserts_every_partition_once() {
        let profile = Locking::default();
        let config = StressConfig {
            partition_values: 42,
            ..StressConfig::default()
        };
        assert_eq!(
            profile.populate_option(&config),
            PopulateOption::Custom {
                rows: 42,
                deletes: false
            }
        );

        let generator = profile.populate_key_generator("001.3.").unwrap();
        assert_eq!(generator.distribution(), KeyDistribution::Sequence);
        assert_eq!(generator.prefix(), "001.3.");

        match runner().next_populate(&PartitionKey::new("001.0.", 5)) {
            Operation::Mutation { statement, .. } => {
                assert_eq!(statement.values(), &[Value::Text("001.0.5".into()), Value::Text("test".into())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
