mod tests_progress;
