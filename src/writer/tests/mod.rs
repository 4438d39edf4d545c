mod tests_pool;
