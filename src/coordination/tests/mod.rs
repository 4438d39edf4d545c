mod tests_local_group;
