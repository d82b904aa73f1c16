mod bplus_tree_test;
mod freelist_test;
mod wal_test;
