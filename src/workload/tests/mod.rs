mod tests_locking;
