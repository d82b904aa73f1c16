mod recovery_test;
