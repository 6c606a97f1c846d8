mod api_sequences;
